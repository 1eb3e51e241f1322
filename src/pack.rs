/*!
 * Packer: content-addressed staging of opaque blobs
 *
 * One pass over the input feeds three consumers at once: the SHA-256
 * hasher, the LZ4 compressor writing a hidden temporary file, and the
 * text classifier. The finished file is renamed to
 * `<root>/{text|bin}/<hex>`.
 */

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};

use debstash_core_manifest::ContentHash;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::checksum::{StreamingHasher, CHUNK_SIZE};
use crate::config::{CompressorKind, StashConfig};
use crate::error::{Result, StashError};
use crate::tools::{check_status, OutputDrain, ToolCommand};

/// LZ4 compression level used by both compressors
pub const LZ4_LEVEL: u32 = 5;

/// Whether a chunk contains only text bytes: tab, newline, vertical tab,
/// form feed, carriage return, and everything from space upward
pub fn is_text_chunk(buf: &[u8]) -> bool {
    !buf.iter().any(|&c| c < 9 || (14..32).contains(&c))
}

/// Monotonic text classifier: once a chunk disqualifies the stream it
/// stays binary
#[derive(Debug, Clone, Copy)]
pub struct TextClassifier {
    text: bool,
}

impl TextClassifier {
    pub fn new() -> Self {
        Self { text: true }
    }

    pub fn feed(&mut self, buf: &[u8]) {
        if self.text {
            self.text = is_text_chunk(buf);
        }
    }

    pub fn is_text(&self) -> bool {
        self.text
    }
}

impl Default for TextClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// An open compression stream targeting one temporary file
pub trait CompressSink: Write {
    /// Close the input and wait for the compressed output to be complete
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Factory for compression streams
pub trait Compressor {
    fn begin(&self, dest: &NamedTempFile) -> Result<Box<dyn CompressSink>>;
}

/// Runs the external `lz4` tool with the destination path appended
pub struct ExternalCompressor {
    tool: ToolCommand,
}

impl ExternalCompressor {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

impl Compressor for ExternalCompressor {
    fn begin(&self, dest: &NamedTempFile) -> Result<Box<dyn CompressSink>> {
        let mut cmd = self.tool.command();
        cmd.arg(dest.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.tool.spawn(&mut cmd)?;

        let stdout = OutputDrain::start(child.stdout.take());
        let stderr = OutputDrain::start(child.stderr.take());
        let stdin = child.stdin.take();

        Ok(Box::new(ExternalSink {
            tool: self.tool.name().to_string(),
            child,
            stdin,
            stdout,
            stderr,
        }))
    }
}

struct ExternalSink {
    tool: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: OutputDrain,
    stderr: OutputDrain,
}

impl Write for ExternalSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::new(ErrorKind::BrokenPipe, "compressor input closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl CompressSink for ExternalSink {
    fn finish(mut self: Box<Self>) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        let stdout = self.stdout.finish();
        let stderr = self.stderr.finish();
        check_status(&self.tool, status, &stdout, &stderr)
    }
}

/// In-process LZ4 frame compression
pub struct BuiltinLz4;

impl Compressor for BuiltinLz4 {
    fn begin(&self, dest: &NamedTempFile) -> Result<Box<dyn CompressSink>> {
        let encoder = lz4::EncoderBuilder::new()
            .level(LZ4_LEVEL)
            .build(dest.reopen()?)?;
        Ok(Box::new(BuiltinSink { encoder }))
    }
}

struct BuiltinSink {
    encoder: lz4::Encoder<File>,
}

impl Write for BuiltinSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

impl CompressSink for BuiltinSink {
    fn finish(self: Box<Self>) -> Result<()> {
        let (file, result) = self.encoder.finish();
        result?;
        file.sync_all()?;
        Ok(())
    }
}

/// Build the compressor selected in the configuration
pub fn compressor_from_config(config: &StashConfig) -> Result<Box<dyn Compressor>> {
    Ok(match config.compressor {
        CompressorKind::External => Box::new(ExternalCompressor::new(ToolCommand::from_argv(
            &config.compressor_command,
        )?)),
        CompressorKind::Builtin => Box::new(BuiltinLz4),
    })
}

/// Result of packing one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed {
    pub hash: ContentHash,
    pub text: bool,
    /// Uncompressed bytes read
    pub size: u64,
    pub staged: PathBuf,
}

/// Staging root plus the compressor to pack with
pub struct Packer<'a> {
    root: PathBuf,
    compressor: &'a dyn Compressor,
}

impl<'a> Packer<'a> {
    pub fn new<P: Into<PathBuf>>(root: P, compressor: &'a dyn Compressor) -> Self {
        Self {
            root: root.into(),
            compressor,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staged location of a blob
    pub fn staged_path(&self, text: bool, hash: &ContentHash) -> PathBuf {
        staged_path(&self.root, text, hash)
    }

    /// Hash, compress and classify everything `source` yields
    pub fn pack<R: Read>(&self, mut source: R) -> Result<Packed> {
        let temp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp~")
            .tempfile_in(&self.root)?;
        let mut sink = self.compressor.begin(&temp)?;

        let mut hasher = StreamingHasher::new();
        let mut classifier = TextClassifier::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut size = 0u64;

        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    abandon(sink);
                    return Err(e.into());
                }
            };
            let chunk = &buffer[..n];
            if let Err(e) = sink.write_all(chunk) {
                // A dead compressor explains itself better than EPIPE
                sink.finish()?;
                return Err(e.into());
            }
            hasher.update(chunk);
            classifier.feed(chunk);
            size += n as u64;
        }

        sink.finish()?;

        let hash = hasher.finalize();
        let text = classifier.is_text();
        let staged = self.staged_path(text, &hash);
        temp.persist(&staged).map_err(|e| StashError::Io(e.error))?;

        debug!(hash = %hash, text, size, "packed blob");
        Ok(Packed {
            hash,
            text,
            size,
            staged,
        })
    }
}

/// `<root>/{text|bin}/<hex>`
pub fn staged_path(root: &Path, text: bool, hash: &ContentHash) -> PathBuf {
    root.join(if text { "text" } else { "bin" })
        .join(hash.to_hex())
}

fn abandon(sink: Box<dyn CompressSink>) {
    if let Err(e) = sink.finish() {
        warn!("compressor failed while abandoning blob: {}", e);
    }
}
