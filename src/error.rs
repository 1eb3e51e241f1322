/*!
 * Error types for debstash
 */

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StashError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;

#[derive(Debug, Error)]
pub enum StashError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Catalog (database) error
    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    /// Manifest format or lifecycle error
    #[error("Manifest error: {0}")]
    Manifest(#[from] debstash_core_manifest::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An external tool could not be started
    #[error("Failed to launch {tool}: {source}")]
    ToolLaunch {
        tool: String,
        #[source]
        source: io::Error,
    },

    /// An external tool exited unsuccessfully
    #[error("{tool} failed ({status}): stdout: {stdout:?} stderr: {stderr:?}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    /// An external tool succeeded but printed something unusable
    #[error("{tool} produced unexpected output: {detail}")]
    ToolOutput { tool: String, detail: String },

    /// The shard-append offset contract was violated
    #[error("Shard position contract violated: {0}")]
    ShardContract(String),

    /// A record references a blob that is missing or not yet stored
    #[error("Blob {hash} is not stored in the catalog")]
    UnstoredBlob { hash: String },

    /// A referenced input file is missing
    #[error("Source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Source control file could not be parsed
    #[error("Invalid control file {}: {reason}", .path.display())]
    ControlFile { path: PathBuf, reason: String },

    /// Worker pool failure (a worker died without reporting)
    #[error("Worker pool error: {0}")]
    Parallel(String),
}

impl StashError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            StashError::Config(_)
            | StashError::Catalog(_)
            | StashError::SourceNotFound(_)
            | StashError::ControlFile { .. }
            | StashError::Manifest(_) => EXIT_FATAL,
            StashError::UnstoredBlob { .. } | StashError::ShardContract(_) => EXIT_INTEGRITY,
            _ => EXIT_PARTIAL,
        }
    }

    /// Whether this error must stop the whole run rather than just the
    /// current item
    pub fn is_run_fatal(&self) -> bool {
        match self {
            StashError::Catalog(_) => true,
            StashError::Config(_) => true,
            StashError::Parallel(_) => true,
            StashError::Manifest(debstash_core_manifest::Error::MalformedHeader { .. }) => true,

            StashError::Io(_) => false,
            StashError::Manifest(_) => false,
            StashError::Json(_) => false,
            StashError::ToolLaunch { .. } => false,
            StashError::ToolFailed { .. } => false,
            StashError::ToolOutput { .. } => false,
            StashError::ShardContract(_) => false,
            StashError::UnstoredBlob { .. } => false,
            StashError::SourceNotFound(_) => false,
            StashError::ControlFile { .. } => false,
        }
    }

    pub(crate) fn tool_output<T: Into<String>, D: Into<String>>(tool: T, detail: D) -> Self {
        StashError::ToolOutput {
            tool: tool.into(),
            detail: detail.into(),
        }
    }
}
