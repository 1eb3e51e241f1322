//! Shard appending
//!
//! Shards are append-only container files owned by an external appender
//! that serializes concurrent writers and pads every record to a 16-byte
//! boundary. The appender prints the offset the record landed at.

use std::path::{Path, PathBuf};

use debstash_core_manifest::ContentHash;
use tracing::debug;

use crate::error::{Result, StashError};
use crate::tools::ToolCommand;

/// Appends one staged blob to a named shard, returning its byte offset
pub trait ShardAppender: Send + Sync {
    fn append(&self, hash: &ContentHash, shard_name: &str, staged: &Path) -> Result<u64>;
}

/// Runs `catfight -e <hash> <shard_dir>/<shard_name> <staged>`
pub struct ExternalShardAppender {
    tool: ToolCommand,
    shard_dir: PathBuf,
}

impl ExternalShardAppender {
    pub fn new<P: Into<PathBuf>>(tool: ToolCommand, shard_dir: P) -> Self {
        Self {
            tool,
            shard_dir: shard_dir.into(),
        }
    }
}

impl ShardAppender for ExternalShardAppender {
    fn append(&self, hash: &ContentHash, shard_name: &str, staged: &Path) -> Result<u64> {
        let mut cmd = self.tool.command();
        cmd.arg("-e")
            .arg(hash.to_hex())
            .arg(self.shard_dir.join(shard_name))
            .arg(staged);

        let stdout = self.tool.run(cmd)?;
        let offset = parse_offset(self.tool.name(), &stdout)?;
        debug!(hash = %hash, shard = shard_name, offset, "appended to shard");
        Ok(offset)
    }
}

fn parse_offset(tool: &str, stdout: &[u8]) -> Result<u64> {
    let text = String::from_utf8_lossy(stdout);
    text.trim()
        .parse()
        .map_err(|_| StashError::tool_output(tool, format!("expected an offset, got {:?}", text.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offset() {
        assert_eq!(parse_offset("catfight", b"4096\n").unwrap(), 4096);
        assert!(matches!(
            parse_offset("catfight", b"lock held"),
            Err(StashError::ToolOutput { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_external_appender_passes_arguments() {
        // only answers when the arguments arrive in the documented order
        let tool = ToolCommand::from_argv(&[
            "sh".to_string(),
            "-c".to_string(),
            "[ \"$1\" = -e ] && [ \"$3\" = /shards/text-3 ] && echo 32".to_string(),
            "catfight".to_string(),
        ])
        .unwrap();
        let appender = ExternalShardAppender::new(tool, "/shards");
        let hash: ContentHash = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse()
            .unwrap();
        let offset = appender
            .append(&hash, "text-3", Path::new("/staged/blob"))
            .unwrap();
        assert_eq!(offset, 32);
    }
}
