//! Manifest header and record data structures
//!
//! A manifest is newline-delimited JSON: the first line is a [`ManifestHeader`],
//! every following line is one [`Record`].

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};

/// Identity of the package a manifest describes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestHeader {
    /// Package name (the archive's file name, or the source package name)
    pub name: String,

    /// Package version, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Hash of the whole top-level input file
    pub hash: ContentHash,
}

impl ManifestHeader {
    /// Create a header without a version
    pub fn new<S: Into<String>>(name: S, hash: ContentHash) -> Self {
        Self {
            name: name.into(),
            version: None,
            hash,
        }
    }

    /// Attach a package version
    pub fn with_version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// One exploded archive entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    /// Path segments, one per archive nesting level
    #[serde(rename = "name")]
    pub path: Vec<String>,

    /// Entry size as declared by the archive
    pub size: u64,

    /// Platform file mode bits
    pub mode: u32,

    /// Content hash; `None` for irregular entries (symlinks, devices, fifos)
    pub hash: Option<ContentHash>,

    /// Whether the content classified as text
    pub text: bool,
}

impl Record {
    /// Record for a regular file whose content was staged
    pub fn regular(path: Vec<String>, size: u64, mode: u32, hash: ContentHash, text: bool) -> Self {
        Self {
            path,
            size,
            mode,
            hash: Some(hash),
            text,
        }
    }

    /// Record for an irregular entry; it has no content
    pub fn irregular(path: Vec<String>, size: u64, mode: u32) -> Self {
        Self {
            path,
            size,
            mode,
            hash: None,
            text: false,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.hash.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_record_wire_format() {
        let hash: ContentHash = EMPTY_SHA256.parse().unwrap();
        let record = Record::regular(
            vec!["foo.tar.gz".to_string(), "foo/README".to_string()],
            0,
            0o644,
            hash,
            true,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["name"][1], "foo/README");
        assert_eq!(value["mode"], 0o644);
        assert_eq!(value["hash"], EMPTY_SHA256);
        assert_eq!(value["text"], true);
    }

    #[test]
    fn test_irregular_record_has_null_hash() {
        let record = Record::irregular(vec!["link".to_string()], 0, 0o777);
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"hash\":null"));
        assert!(!record.is_regular());

        let back: Record = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_header_version_is_optional() {
        let hash: ContentHash = EMPTY_SHA256.parse().unwrap();
        let header = ManifestHeader::new("pkg.tar", hash);
        let line = serde_json::to_string(&header).unwrap();
        assert!(!line.contains("version"));

        let versioned = header.with_version("1.2-3");
        let line = serde_json::to_string(&versioned).unwrap();
        assert!(line.contains("\"version\":\"1.2-3\""));
    }
}
