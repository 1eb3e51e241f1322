/*!
 * Debian source control (`.dsc`) files
 *
 * A `.dsc` names a source package, its version and the files that make it
 * up. All referenced files are exploded into one manifest identified by the
 * package rather than by any single archive.
 */

use std::fs;
use std::path::Path;

use debstash_core_manifest::{ManifestHeader, ManifestWriter};
use tracing::info;

use crate::checksum::hash_file;
use crate::error::{Result, StashError};
use crate::explode::{ExplodeRun, ExplodeSummary, Exploder};

const PGP_SIGNED_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const PGP_SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";

/// One line of the `Files` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub md5: String,
    pub size: u64,
    pub name: String,
}

/// The fields of a `.dsc` this pipeline cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceControl {
    pub source: String,
    pub version: String,
    pub files: Vec<SourceFile>,
}

/// Split the first deb822 paragraph into `(field, value)` pairs, with
/// continuation lines joined by newlines. Cleartext signature armour is
/// skipped.
pub fn parse_paragraph(text: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let mut lines = text.lines().peekable();

    while lines.peek().is_some_and(|l| l.trim().is_empty()) {
        lines.next();
    }
    if lines.peek().is_some_and(|l| l.trim_end() == PGP_SIGNED_HEADER) {
        // armour headers ("Hash: SHA256") run until the first blank line
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
        }
    }

    let mut fields: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.trim_end() == PGP_SIGNATURE_HEADER {
            break;
        }
        if line.trim().is_empty() {
            if fields.is_empty() {
                continue;
            }
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let (_, value) = fields
                .last_mut()
                .ok_or_else(|| "continuation line before first field".to_string())?;
            value.push('\n');
            value.push_str(line.trim());
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("not a field: {:?}", line))?;
        fields.push((name.trim().to_string(), value.trim().to_string()));
    }

    if fields.is_empty() {
        return Err("no control paragraph".to_string());
    }
    Ok(fields)
}

fn field<'f>(fields: &'f [(String, String)], name: &str) -> Option<&'f str> {
    fields
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn parse_files_line(line: &str) -> std::result::Result<SourceFile, String> {
    let mut parts = line.split_whitespace();
    let (md5, size, name) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(md5), Some(size), Some(name), None) => (md5, size, name),
        _ => return Err(format!("malformed Files line: {:?}", line)),
    };

    if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("bad md5 in Files line: {:?}", line));
    }
    let size = size
        .parse()
        .map_err(|_| format!("bad size in Files line: {:?}", line))?;
    if name.contains('/') || name == "." || name == ".." {
        return Err(format!("referenced file must be a bare name: {:?}", name));
    }

    Ok(SourceFile {
        md5: md5.to_string(),
        size,
        name: name.to_string(),
    })
}

impl SourceControl {
    /// Parse `.dsc` text; `path` only labels errors
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let invalid = |reason: String| StashError::ControlFile {
            path: path.to_path_buf(),
            reason,
        };

        let fields = parse_paragraph(text).map_err(invalid)?;
        let required = |name: &str| {
            field(&fields, name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("missing {} field", name)))
        };

        let source = required("Source")?;
        let version = required("Version")?;
        let files = required("Files")?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(parse_files_line)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(invalid)?;

        Ok(Self {
            source,
            version,
            files,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StashError::SourceNotFound(path.to_path_buf()),
            _ => StashError::Io(e),
        })?;
        Self::parse(path, &String::from_utf8_lossy(&bytes))
    }
}

/// Explode every file a `.dsc` references into one manifest
pub fn explode_dsc(exploder: &Exploder, dsc_path: &Path, manifest_dir: &Path) -> Result<ExplodeSummary> {
    let control = SourceControl::load(dsc_path)?;
    let dir = dsc_path.parent().unwrap_or_else(|| Path::new("."));

    for file in &control.files {
        let path = dir.join(&file.name);
        if !path.is_file() {
            return Err(StashError::SourceNotFound(path));
        }
    }

    let hash = hash_file(dsc_path)?;
    let header = ManifestHeader::new(control.source.clone(), hash).with_version(control.version.clone());
    info!(
        source = %control.source,
        version = %control.version,
        files = control.files.len(),
        "exploding source package"
    );

    let mut writer = ManifestWriter::create(manifest_dir, &header)?;
    let diagnostics = {
        let mut run = ExplodeRun::new(&mut writer);
        for file in &control.files {
            exploder.explode_file(&dir.join(&file.name), vec![file.name.clone()], &mut run)?;
        }
        run.into_diagnostics()
    };

    let records = writer.records_written();
    let manifest = writer.persist()?;
    info!(manifest = %manifest.display(), records, "manifest written");
    diagnostics.log_summary();

    Ok(ExplodeSummary {
        manifest,
        header,
        records,
        diagnostics,
    })
}
