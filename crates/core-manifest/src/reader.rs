//! Manifest reading

use crate::error::{Error, Result};
use crate::record::{ManifestHeader, Record};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Reads one manifest: the header eagerly, records lazily
pub struct ManifestReader<R: BufRead> {
    header: ManifestHeader,
    info: Value,
    lines: Lines<R>,
    line_no: usize,
}

impl ManifestReader<BufReader<File>> {
    /// Open a manifest file and parse its header line
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), path)
    }
}

impl<R: BufRead> ManifestReader<R> {
    /// Parse the header from `reader`; `origin` only labels errors
    pub fn from_reader(reader: R, origin: &Path) -> Result<Self> {
        let mut lines = reader.lines();
        let first = match lines.next() {
            Some(line) => line?,
            None => return Err(Error::malformed_header(origin, "empty manifest")),
        };

        let info: Value = serde_json::from_str(&first)
            .map_err(|e| Error::malformed_header(origin, e.to_string()))?;
        if !info.is_object() {
            return Err(Error::malformed_header(origin, "header is not a JSON object"));
        }
        let header: ManifestHeader = serde_json::from_value(info.clone())
            .map_err(|e| Error::malformed_header(origin, e.to_string()))?;

        Ok(Self {
            header,
            info,
            lines,
            line_no: 1,
        })
    }

    pub fn header(&self) -> &ManifestHeader {
        &self.header
    }

    /// The header exactly as written, including any fields this crate does
    /// not model
    pub fn info(&self) -> &Value {
        &self.info
    }
}

impl<R: BufRead> Iterator for ManifestReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|source| Error::MalformedRecord {
                line: self.line_no,
                source,
            }));
        }
    }
}
