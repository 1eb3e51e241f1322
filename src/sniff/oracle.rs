//! MIME type oracles

use crate::error::Result;
use crate::tools::ToolCommand;

/// Answers "what MIME type is this byte prefix?"
pub trait MimeOracle {
    /// Type of the bytes as they are
    fn mime_type(&self, prefix: &[u8]) -> Result<String>;

    /// Type after looking through one layer of compression
    fn inner_mime_type(&self, prefix: &[u8]) -> Result<String>;
}

/// Oracle backed by `file(1)` reading the prefix on stdin
pub struct FileCommandOracle {
    tool: ToolCommand,
}

impl FileCommandOracle {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    fn query(&self, prefix: &[u8], uncompress: bool) -> Result<String> {
        let mut cmd = self.tool.command();
        if uncompress {
            cmd.arg("--uncompress");
        }
        cmd.arg("-");
        let out = self.tool.run_with_input(cmd, prefix)?;
        Ok(essence(&String::from_utf8_lossy(&out)).to_string())
    }
}

impl MimeOracle for FileCommandOracle {
    fn mime_type(&self, prefix: &[u8]) -> Result<String> {
        self.query(prefix, false)
    }

    fn inner_mime_type(&self, prefix: &[u8]) -> Result<String> {
        self.query(prefix, true)
    }
}

/// Strip parameters and whitespace: `"text/plain; charset=us-ascii\n"` is
/// `"text/plain"`
pub fn essence(mime: &str) -> &str {
    mime.split(';').next().unwrap_or("").trim()
}
