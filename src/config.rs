/*!
 * Configuration types for debstash
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StashError};

/// Which compressor packs staged blobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    /// Run the external `lz4` tool
    #[default]
    External,

    /// Compress in-process with the lz4 crate (same frame format)
    Builtin,
}

/// Main configuration shared by every stage of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StashConfig {
    /// Staging root; holds `text/`, `bin/` and `manifests/`
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// SQLite catalog file (None = `<root>/catalog.sqlite`)
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    /// Directory the shard appender writes shard containers into
    /// (None = `<root>/shards`)
    #[serde(default)]
    pub shard_dir: Option<PathBuf>,

    /// Ingestion worker threads (0 = 2x available parallelism)
    #[serde(default)]
    pub workers: usize,

    /// Bounded queue capacity between the staging scan and the workers
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum concurrent indexer subprocesses (0 = 2x available parallelism)
    #[serde(default)]
    pub max_indexers: usize,

    /// Sleep between supervisor ticks when there is nothing to launch
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How long a catalog connection waits for the write lock
    #[serde(default = "default_busy_timeout")]
    pub catalog_busy_timeout_secs: u64,

    /// Nested archives larger than this are stored as opaque blobs instead
    /// of being spooled and exploded
    #[serde(default = "default_max_spool_bytes")]
    pub max_spool_bytes: u64,

    /// Bytes of each entry handed to the sniffer
    #[serde(default = "default_sniff_prefix")]
    pub sniff_prefix_bytes: usize,

    /// Compressor used by the packer
    #[serde(default)]
    pub compressor: CompressorKind,

    /// Archive normalizer: reads any archive on stdin, writes tar to stdout
    #[serde(default = "default_normalizer_command")]
    pub normalizer_command: Vec<String>,

    /// External compressor; the destination path is appended
    #[serde(default = "default_compressor_command")]
    pub compressor_command: Vec<String>,

    /// Shard appender; `-e <hash> <shard> <path>` is appended
    #[serde(default = "default_shard_append_command")]
    pub shard_append_command: Vec<String>,

    /// MIME sniffer reading a prefix on stdin; `--uncompress` is added for
    /// the compression-aware variant
    #[serde(default = "default_mime_command")]
    pub mime_command: Vec<String>,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            catalog_path: None,
            shard_dir: None,
            workers: 0,
            queue_capacity: default_queue_capacity(),
            max_indexers: 0,
            poll_interval_secs: default_poll_interval(),
            catalog_busy_timeout_secs: default_busy_timeout(),
            max_spool_bytes: default_max_spool_bytes(),
            sniff_prefix_bytes: default_sniff_prefix(),
            compressor: CompressorKind::default(),
            normalizer_command: default_normalizer_command(),
            compressor_command: default_compressor_command(),
            shard_append_command: default_shard_append_command(),
            mime_command: default_mime_command(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("packed")
}

fn default_queue_capacity() -> usize {
    100
}

fn default_poll_interval() -> u64 {
    5
}

fn default_busy_timeout() -> u64 {
    60
}

fn default_max_spool_bytes() -> u64 {
    2 * 1024 * 1024 * 1024 // 2 GiB
}

fn default_sniff_prefix() -> usize {
    64
}

fn default_normalizer_command() -> Vec<String> {
    ["bsdtar", "-c", "-f", "-", "@-"].map(String::from).to_vec()
}

fn default_compressor_command() -> Vec<String> {
    ["lz4", "-5", "-q", "-f", "-"].map(String::from).to_vec()
}

fn default_shard_append_command() -> Vec<String> {
    vec!["catfight".to_string()]
}

fn default_mime_command() -> Vec<String> {
    ["file", "--brief", "--mime-type"].map(String::from).to_vec()
}

/// Number of hardware threads, falling back to 1 when undetectable
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl StashConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| StashError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| StashError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Staging directory for text blobs
    pub fn text_dir(&self) -> PathBuf {
        self.root.join("text")
    }

    /// Staging directory for binary blobs
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.root.join("catalog.sqlite"))
    }

    pub fn shard_dir(&self) -> PathBuf {
        self.shard_dir
            .clone()
            .unwrap_or_else(|| self.root.join("shards"))
    }

    /// Ingestion worker count after auto-detection
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            available_parallelism() * 2
        } else {
            self.workers
        }
    }

    /// Indexer subprocess cap after auto-detection
    pub fn effective_max_indexers(&self) -> usize {
        if self.max_indexers == 0 {
            available_parallelism() * 2
        } else {
            self.max_indexers
        }
    }

    /// Reject settings no stage can run with
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(StashError::Config("queue_capacity must be > 0".to_string()));
        }
        if self.sniff_prefix_bytes < 8 {
            return Err(StashError::Config(
                "sniff_prefix_bytes must be at least 8".to_string(),
            ));
        }
        for (name, command) in [
            ("normalizer_command", &self.normalizer_command),
            ("compressor_command", &self.compressor_command),
            ("shard_append_command", &self.shard_append_command),
            ("mime_command", &self.mime_command),
        ] {
            if command.is_empty() {
                return Err(StashError::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }

    /// Create the staging, manifest and shard directories
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.text_dir(),
            self.bin_dir(),
            self.manifest_dir(),
            self.shard_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
