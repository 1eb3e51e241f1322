//! Error types for manifest operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for manifest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while writing, reading or claiming manifests
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The first line of a manifest is missing or is not a valid header
    #[error("Malformed manifest header in {path}: {reason}")]
    MalformedHeader { path: PathBuf, reason: String },

    /// A record line could not be decoded
    #[error("Malformed record on line {line}: {source}")]
    MalformedRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Invalid content hash format
    #[error("Invalid content hash: {0}")]
    InvalidContentHash(String),
}

impl Error {
    /// Create a malformed header error
    pub fn malformed_header<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Error::MalformedHeader {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
