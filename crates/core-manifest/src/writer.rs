//! Atomic manifest creation
//!
//! Manifests are written under a hidden temporary name inside the manifest
//! directory and renamed to `<hash>.manifest` only once complete, so a
//! poller never observes a partially written manifest.

use crate::error::{Error, Result};
use crate::record::{ManifestHeader, Record};
use crate::MANIFEST_EXTENSION;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// File name a manifest is published under
pub fn manifest_file_name(header: &ManifestHeader) -> String {
    format!("{}{}", header.hash, MANIFEST_EXTENSION)
}

/// Streaming writer for one manifest
pub struct ManifestWriter {
    out: BufWriter<NamedTempFile>,
    dir: PathBuf,
    file_name: String,
    records: u64,
}

impl ManifestWriter {
    /// Start a manifest in `dir`, writing the header line immediately
    pub fn create(dir: &Path, header: &ManifestHeader) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp~")
            .tempfile_in(dir)?;

        let mut out = BufWriter::new(temp);
        serde_json::to_writer(&mut out, header)?;
        out.write_all(b"\n")?;

        Ok(Self {
            out,
            dir: dir.to_path_buf(),
            file_name: manifest_file_name(header),
            records: 0,
        })
    }

    /// Append one record line
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    /// Number of records written so far
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Flush, sync and rename into place. Dropping the writer without
    /// calling this removes the temporary file.
    pub fn persist(self) -> Result<PathBuf> {
        let temp = self.out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        temp.as_file().sync_all()?;

        let dest = self.dir.join(&self.file_name);
        temp.persist(&dest).map_err(|e| Error::Io(e.error))?;
        debug!(path = %dest.display(), records = self.records, "manifest published");
        Ok(dest)
    }
}
