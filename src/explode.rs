/*!
 * Recursive archive exploder
 *
 * Every container is first normalized into a tar stream by an external
 * normalizer, then walked entry by entry. Nested archives are spooled to a
 * temporary file and exploded depth-first; everything else goes through the
 * packer and becomes one manifest record.
 */

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Stdio};

use debstash_core_manifest::{ManifestHeader, ManifestWriter, Record};
use tracing::{debug, info, warn};

use crate::checksum::hash_file;
use crate::config::StashConfig;
use crate::error::{Result, StashError};
use crate::pack::Packer;
use crate::sniff::{MimeOracle, SniffDiagnostics, Sniffer};
use crate::tools::{check_status, OutputDrain, ToolCommand};

/// Destination for records, in production order
pub trait RecordSink {
    fn push(&mut self, record: Record) -> Result<()>;
}

impl RecordSink for Vec<Record> {
    fn push(&mut self, record: Record) -> Result<()> {
        Vec::push(self, record);
        Ok(())
    }
}

impl RecordSink for ManifestWriter {
    fn push(&mut self, record: Record) -> Result<()> {
        self.write_record(&record)?;
        Ok(())
    }
}

/// A tar byte stream produced from some container
pub trait TarStream: Read {
    /// Release the stream and report how the producer ended
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Turns any supported container format into a tar stream
pub trait Normalizer {
    fn normalize(&self, input: File) -> Result<Box<dyn TarStream>>;
}

/// `bsdtar -c -f - @-`: reads any archive libarchive understands on stdin
/// and re-emits its entries as tar
pub struct BsdtarNormalizer {
    tool: ToolCommand,
}

impl BsdtarNormalizer {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }
}

impl Normalizer for BsdtarNormalizer {
    fn normalize(&self, input: File) -> Result<Box<dyn TarStream>> {
        let mut cmd = self.tool.command();
        cmd.stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = self.tool.spawn(&mut cmd)?;

        let stderr = OutputDrain::start(child.stderr.take());
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StashError::tool_output(self.tool.name(), "stdout not captured"))?;

        Ok(Box::new(ChildTarStream {
            tool: self.tool.name().to_string(),
            child,
            stdout,
            stderr,
        }))
    }
}

struct ChildTarStream {
    tool: String,
    child: Child,
    stdout: ChildStdout,
    stderr: OutputDrain,
}

impl Read for ChildTarStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl TarStream for ChildTarStream {
    fn finish(mut self: Box<Self>) -> Result<()> {
        // tar stops reading at the end-of-archive marker; swallow the
        // trailing block padding so the normalizer can exit cleanly
        let _ = io::copy(&mut self.stdout, &mut io::sink());
        let status = self.child.wait()?;
        let stderr = self.stderr.finish();
        check_status(&self.tool, status, &[], &stderr)
    }
}

/// Collapse `.`, `..`, repeated and trailing slashes the way a POSIX
/// `normpath` would
pub fn normalize_entry_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    let absolute = name.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for part in name.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Per-manifest state threaded through one explosion
pub struct ExplodeRun<'s> {
    sink: &'s mut dyn RecordSink,
    diagnostics: SniffDiagnostics,
    seen: HashSet<Vec<String>>,
    duplicates: u64,
}

impl<'s> ExplodeRun<'s> {
    pub fn new(sink: &'s mut dyn RecordSink) -> Self {
        Self {
            sink,
            diagnostics: SniffDiagnostics::new(),
            seen: HashSet::new(),
            duplicates: 0,
        }
    }

    fn emit(&mut self, record: Record) -> Result<()> {
        if !self.seen.insert(record.path.clone()) {
            warn!(path = ?record.path, "duplicate entry path, keeping the first");
            self.duplicates += 1;
            return Ok(());
        }
        self.sink.push(record)
    }

    pub fn diagnostics(&self) -> &SniffDiagnostics {
        &self.diagnostics
    }

    /// Entries dropped because their path was already produced
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn into_diagnostics(self) -> SniffDiagnostics {
        self.diagnostics
    }
}

/// Whether a level keeps going after an entry
enum Flow {
    Continue,
    Truncated,
}

/// Remembers whether the underlying reader failed, so read errors from a
/// broken tar stream can be told apart from packer failures
struct TrackedReader<R> {
    inner: R,
    failed: bool,
}

impl<R: Read> TrackedReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            failed: false,
        }
    }
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            if e.kind() != ErrorKind::Interrupted {
                self.failed = true;
            }
        })
    }
}

pub struct Exploder<'a> {
    normalizer: &'a dyn Normalizer,
    sniffer: Sniffer<'a>,
    packer: &'a Packer<'a>,
    prefix_len: usize,
    max_spool_bytes: u64,
}

impl<'a> Exploder<'a> {
    pub fn new(
        normalizer: &'a dyn Normalizer,
        oracle: &'a dyn MimeOracle,
        packer: &'a Packer<'a>,
        config: &StashConfig,
    ) -> Self {
        Self {
            normalizer,
            sniffer: Sniffer::new(oracle),
            packer,
            prefix_len: config.sniff_prefix_bytes,
            max_spool_bytes: config.max_spool_bytes,
        }
    }

    /// Explode one container, appending records under `path_so_far`
    pub fn explode(&self, input: File, path_so_far: &[String], run: &mut ExplodeRun) -> Result<()> {
        let mut stream = self.normalizer.normalize(input)?;
        let walked = self.walk(&mut *stream, path_so_far, run);

        // Always reap the normalizer, even when the walk failed
        if let Err(e) = stream.finish() {
            warn!(path = ?path_so_far, "normalizer did not finish cleanly: {}", e);
        }
        walked
    }

    fn walk(&self, stream: &mut dyn TarStream, path_so_far: &[String], run: &mut ExplodeRun) -> Result<()> {
        let mut archive = tar::Archive::new(stream);
        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = ?path_so_far, "unreadable tar stream: {}", e);
                return Ok(());
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = ?path_so_far, "malformed tar framing, truncating: {}", e);
                    break;
                }
            };
            if let Flow::Truncated = self.visit(entry, path_so_far, run)? {
                break;
            }
        }
        Ok(())
    }

    /// Treat a plain file as a single top-level entry named `entry_path`:
    /// exploded if it sniffs as an archive, packed otherwise
    pub fn explode_file(&self, path: &Path, entry_path: Vec<String>, run: &mut ExplodeRun) -> Result<()> {
        let mut file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StashError::SourceNotFound(path.to_path_buf()),
            _ => StashError::Io(e),
        })?;
        let size = file.metadata()?.len();

        let mut prefix = Vec::with_capacity(self.prefix_len);
        (&mut file).take(self.prefix_len as u64).read_to_end(&mut prefix)?;
        file.seek(SeekFrom::Start(0))?;

        if self.sniffer.should_recurse(&prefix, &mut run.diagnostics) {
            return self.explode(file, &entry_path, run);
        }

        let packed = self.packer.pack(file)?;
        run.emit(Record::regular(entry_path, size, 0o644, packed.hash, packed.text))
    }

    fn visit<R: Read>(
        &self,
        entry: tar::Entry<'_, R>,
        path_so_far: &[String],
        run: &mut ExplodeRun,
    ) -> Result<Flow> {
        let header = entry.header();
        let kind = header.entry_type();
        let mode = header.mode().unwrap_or(0);
        let size = entry.size();
        let name = normalize_entry_name(&entry.path_bytes());

        if kind.is_dir() {
            return Ok(Flow::Continue);
        }

        let mut path = path_so_far.to_vec();
        path.push(name);

        if !kind.is_file() {
            debug!(path = ?path, kind = ?kind, "irregular entry");
            run.emit(Record::irregular(path, size, mode))?;
            return Ok(Flow::Continue);
        }

        let mut reader = TrackedReader::new(entry);
        let mut prefix = Vec::with_capacity(self.prefix_len);
        if let Err(e) = (&mut reader).take(self.prefix_len as u64).read_to_end(&mut prefix) {
            warn!(path = ?path, "entry unreadable, truncating: {}", e);
            return Ok(Flow::Truncated);
        }

        let mut recurse = self.sniffer.should_recurse(&prefix, &mut run.diagnostics);
        if recurse && size > self.max_spool_bytes {
            warn!(path = ?path, size, "nested archive too large to spool, storing as opaque");
            recurse = false;
        }

        if recurse {
            let spool = match self.spool(&prefix, &mut reader) {
                Ok((spool, spooled)) if spooled == size => spool,
                Ok((_, spooled)) => {
                    warn!(path = ?path, size, spooled, "nested archive truncated, skipping");
                    return Ok(Flow::Truncated);
                }
                Err(e) if reader.failed => {
                    warn!(path = ?path, "nested archive truncated, skipping: {}", e);
                    return Ok(Flow::Truncated);
                }
                Err(e) => return Err(e),
            };
            debug!(path = ?path, size, "exploding nested archive");
            self.explode(spool, &path, run)?;
            return Ok(Flow::Continue);
        }

        match self.packer.pack(Cursor::new(prefix).chain(&mut reader)) {
            Ok(packed) if packed.size == size => {
                run.emit(Record::regular(path, size, mode, packed.hash, packed.text))?;
                Ok(Flow::Continue)
            }
            Ok(packed) => {
                // tar reports a short body as a clean end of entry
                warn!(path = ?path, size, read = packed.size, "entry truncated, skipping");
                Ok(Flow::Truncated)
            }
            Err(e) if reader.failed => {
                warn!(path = ?path, "entry truncated, skipping: {}", e);
                Ok(Flow::Truncated)
            }
            Err(e) => Err(e),
        }
    }

    fn spool<R: Read>(&self, prefix: &[u8], rest: &mut R) -> Result<(File, u64)> {
        let mut spool = tempfile::tempfile()?;
        spool.write_all(prefix)?;
        let copied = io::copy(rest, &mut spool)?;
        spool.seek(SeekFrom::Start(0))?;
        Ok((spool, prefix.len() as u64 + copied))
    }
}

/// Optional identity overrides for a top-level archive
#[derive(Debug, Clone, Default)]
pub struct ArchiveIdentity {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// What one exploder run produced
#[derive(Debug)]
pub struct ExplodeSummary {
    pub manifest: PathBuf,
    pub header: ManifestHeader,
    pub records: u64,
    pub diagnostics: SniffDiagnostics,
}

/// Explode one archive file into a published manifest
pub fn explode_archive(
    exploder: &Exploder,
    path: &Path,
    identity: ArchiveIdentity,
    manifest_dir: &Path,
) -> Result<ExplodeSummary> {
    if !path.is_file() {
        return Err(StashError::SourceNotFound(path.to_path_buf()));
    }

    let hash = hash_file(path)?;
    let name = identity.name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    });
    let mut header = ManifestHeader::new(name, hash);
    if let Some(version) = identity.version {
        header = header.with_version(version);
    }

    info!(archive = %path.display(), hash = %hash, "exploding");
    let mut writer = ManifestWriter::create(manifest_dir, &header)?;
    let diagnostics = {
        let mut run = ExplodeRun::new(&mut writer);
        exploder.explode(File::open(path)?, &[], &mut run)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::BuiltinLz4;
    use std::fs;
    use tempfile::TempDir;

    /// Treats every input as a tar stream already
    struct Passthrough;

    struct FileStream(File);

    impl Read for FileStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl TarStream for FileStream {
        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    impl Normalizer for Passthrough {
        fn normalize(&self, input: File) -> Result<Box<dyn TarStream>> {
            Ok(Box::new(FileStream(input)))
        }
    }

    /// Recurses into anything that looks like a tar header at offset 257
    struct TarOracle;

    impl MimeOracle for TarOracle {
        fn mime_type(&self, prefix: &[u8]) -> Result<String> {
            if prefix.len() >= 262 && &prefix[257..262] == b"ustar" {
                Ok("application/x-tar".to_string())
            } else {
                Ok("application/octet-stream".to_string())
            }
        }

        fn inner_mime_type(&self, _prefix: &[u8]) -> Result<String> {
            Ok("application/octet-stream".to_string())
        }
    }

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_ustar();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn staging() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("text")).unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        dir
    }

    fn config() -> StashConfig {
        StashConfig {
            sniff_prefix_bytes: 512,
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_entry_name() {
        assert_eq!(normalize_entry_name(b"./a/b/"), "a/b");
        assert_eq!(normalize_entry_name(b"a//b/./c"), "a/b/c");
        assert_eq!(normalize_entry_name(b"a/../b"), "b");
        assert_eq!(normalize_entry_name(b"../x"), "../x");
        assert_eq!(normalize_entry_name(b"/../etc"), "/etc");
        assert_eq!(normalize_entry_name(b"./"), ".");
        assert_eq!(normalize_entry_name(b"caf\xe9"), "caf\u{fffd}");
    }

    #[test]
    fn test_nested_tar_is_exploded_depth_first() {
        let dir = staging();
        let inner = tar_bytes(&[("inner.txt", &b"inner text"[..])]);
        let outer = tar_bytes(&[
            ("first.txt", &b"first"[..]),
            ("nested.tar", &inner[..]),
            ("last.bin", &b"\x00\x01\x02"[..]),
        ]);
        let archive = dir.path().join("outer.tar");
        fs::write(&archive, &outer).unwrap();

        let packer = Packer::new(dir.path(), &BuiltinLz4);
        let exploder = Exploder::new(&Passthrough, &TarOracle, &packer, &config());

        let mut records: Vec<Record> = Vec::new();
        let mut run = ExplodeRun::new(&mut records);
        exploder
            .explode(File::open(&archive).unwrap(), &[], &mut run)
            .unwrap();
        assert_eq!(run.diagnostics().recursed(), 1);

        let paths: Vec<Vec<String>> = records.iter().map(|r| r.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["first.txt".to_string()],
                vec!["nested.tar".to_string(), "inner.txt".to_string()],
                vec!["last.bin".to_string()],
            ]
        );
        assert!(records[0].text);
        assert!(!records[2].text);
        assert_eq!(records[1].size, 10);
    }

    #[test]
    fn test_irregular_and_duplicate_entries() {
        let dir = staging();
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir_header = tar::Header::new_ustar();
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        builder.append_data(&mut dir_header, "d/", &b""[..]).unwrap();

        let mut link = tar::Header::new_ustar();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "d/link", "target").unwrap();

        for _ in 0..2 {
            let mut file = tar::Header::new_ustar();
            file.set_entry_type(tar::EntryType::Regular);
            file.set_size(3);
            file.set_mode(0o600);
            builder.append_data(&mut file, "d/f", &b"abc"[..]).unwrap();
        }
        let archive = dir.path().join("a.tar");
        fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        let packer = Packer::new(dir.path(), &BuiltinLz4);
        let exploder = Exploder::new(&Passthrough, &TarOracle, &packer, &config());
        let mut records: Vec<Record> = Vec::new();
        let mut run = ExplodeRun::new(&mut records);
        exploder
            .explode(File::open(&archive).unwrap(), &[], &mut run)
            .unwrap();
        assert_eq!(run.duplicates(), 1);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, vec!["d/link".to_string()]);
        assert!(records[0].hash.is_none());
        assert_eq!(records[1].path, vec!["d/f".to_string()]);
        assert_eq!(records[1].mode, 0o600);
    }

    #[test]
    fn test_truncated_stream_keeps_earlier_records() {
        let dir = staging();
        let mut bytes = tar_bytes(&[("a.txt", &b"aaaa"[..]), ("b.txt", &[b'b'; 4096][..])]);
        // cut inside the second entry's body
        bytes.truncate(512 + 512 + 512 + 100);
        let archive = dir.path().join("cut.tar");
        fs::write(&archive, &bytes).unwrap();

        let packer = Packer::new(dir.path(), &BuiltinLz4);
        let exploder = Exploder::new(&Passthrough, &TarOracle, &packer, &config());
        let mut records: Vec<Record> = Vec::new();
        let mut run = ExplodeRun::new(&mut records);
        exploder
            .explode(File::open(&archive).unwrap(), &[], &mut run)
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_explode_archive_publishes_manifest() {
        let dir = staging();
        let manifests = dir.path().join("manifests");
        let archive = dir.path().join("pkg.tar");
        fs::write(&archive, tar_bytes(&[("README", &b"read me\n"[..])])).unwrap();

        let packer = Packer::new(dir.path(), &BuiltinLz4);
        let exploder = Exploder::new(&Passthrough, &TarOracle, &packer, &config());
        let identity = ArchiveIdentity {
            name: None,
            version: Some("1.0-1".to_string()),
        };
        let summary = explode_archive(&exploder, &archive, identity, &manifests).unwrap();

        let hash = hash_file(&archive).unwrap();
        assert_eq!(summary.header.hash, hash);
        assert_eq!(summary.header.name, "pkg.tar");
        assert_eq!(summary.records, 1);
        assert_eq!(
            summary.manifest,
            manifests.join(format!("{}.manifest", hash.to_hex()))
        );
    }

    #[test]
    fn test_missing_archive() {
        let dir = staging();
        let packer = Packer::new(dir.path(), &BuiltinLz4);
        let exploder = Exploder::new(&Passthrough, &TarOracle, &packer, &config());
        let err = explode_archive(
            &exploder,
            &dir.path().join("absent.tar"),
            ArchiveIdentity::default(),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, StashError::SourceNotFound(_)));
    }
}
