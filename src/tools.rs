/*!
 * External tool invocation
 *
 * The normalizer, compressor, shard appender and MIME sniffer are separate
 * programs. Every call goes through the same contract: spawn with piped
 * streams, capture stdout/stderr, and turn a non-zero exit status into a
 * [`StashError::ToolFailed`] carrying both captured streams.
 */

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use crate::error::{Result, StashError};

/// A configured external program plus its fixed leading arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
}

impl ToolCommand {
    /// Build from an argv vector (`["bsdtar", "-c", ...]`)
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| StashError::Config("empty tool command".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Program name, used to label errors and log lines
    pub fn name(&self) -> &str {
        &self.program
    }

    /// A `Command` with the fixed arguments applied; callers append the rest
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Spawn, mapping a launch failure to [`StashError::ToolLaunch`]
    pub fn spawn(&self, cmd: &mut Command) -> Result<Child> {
        cmd.spawn().map_err(|source| StashError::ToolLaunch {
            tool: self.program.clone(),
            source,
        })
    }

    /// Run to completion with `input` on stdin, returning stdout
    pub fn run_with_input(&self, mut cmd: Command, input: &[u8]) -> Result<Vec<u8>> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.spawn(&mut cmd)?;

        // Feed stdin from a separate thread so a chatty tool cannot deadlock
        // against a full stdout pipe. A tool may legitimately stop reading
        // early (the MIME sniffer does), so write errors are ignored.
        let feeder = child.stdin.take().map(|mut stdin| {
            let input = input.to_vec();
            thread::spawn(move || {
                let _ = stdin.write_all(&input);
            })
        });

        let output = child.wait_with_output()?;
        if let Some(feeder) = feeder {
            let _ = feeder.join();
        }

        check_status(self.name(), output.status, &output.stdout, &output.stderr)?;
        Ok(output.stdout)
    }

    /// Run to completion with stdin closed, returning stdout
    pub fn run(&self, mut cmd: Command) -> Result<Vec<u8>> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = self.spawn(&mut cmd)?;
        let output = child.wait_with_output()?;
        check_status(self.name(), output.status, &output.stdout, &output.stderr)?;
        Ok(output.stdout)
    }
}

/// Turn an exit status plus captured output into a result
pub fn check_status(tool: &str, status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(StashError::ToolFailed {
        tool: tool.to_string(),
        status,
        stdout: String::from_utf8_lossy(stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    })
}

/// Collects one of a child's output streams on a background thread while
/// the caller is busy with the other pipes
pub struct OutputDrain {
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl OutputDrain {
    pub fn start<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let handle = stream.map(|mut stream| {
            thread::spawn(move || {
                let mut captured = Vec::new();
                let _ = stream.read_to_end(&mut captured);
                captured
            })
        });
        Self { handle }
    }

    /// Wait for the stream to close and return what was captured
    pub fn finish(mut self) -> Vec<u8> {
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}
