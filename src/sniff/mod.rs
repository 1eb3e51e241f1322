/*!
 * Archive sniffing
 *
 * Decides from a short byte prefix whether an entry is a nested archive
 * worth exploding or an opaque blob to be stored as-is. Cheap byte-pattern
 * rejects run first; only the survivors cost a MIME oracle call.
 */

pub mod oracle;

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

pub use oracle::{essence, FileCommandOracle, MimeOracle};

/// MIME types that are exploded rather than stored
pub const ARCHIVE_TYPES: [&str; 3] = [
    "application/java-archive",
    "application/x-tar",
    "application/zip",
];

/// Major MIME classes that are never archives
const OPAQUE_MAJORS: [&str; 4] = ["text", "image", "audio", "message"];

/// Bytes of prefix recorded in the prefix histogram
pub const DIAGNOSTIC_PREFIX_LEN: usize = 6;

const MIN_PREFIX_LEN: usize = 8;

/// Sniffer misses gathered over one exploder run, used offline to tune
/// the cheap rejects
#[derive(Debug, Default, Clone)]
pub struct SniffDiagnostics {
    ignored_types: BTreeSet<String>,
    prefix_counts: HashMap<Vec<u8>, u64>,
    recursed: u64,
}

impl SniffDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_prefix(&mut self, prefix: &[u8]) {
        let key = prefix[..prefix.len().min(DIAGNOSTIC_PREFIX_LEN)].to_vec();
        *self.prefix_counts.entry(key).or_insert(0) += 1;
    }

    fn record_ignored(&mut self, mime: &str) {
        self.ignored_types.insert(mime.to_string());
    }

    /// MIME types the oracle reported that were not archives
    pub fn ignored_types(&self) -> &BTreeSet<String> {
        &self.ignored_types
    }

    /// How often a given prefix reached the oracle without being an archive
    pub fn prefix_count(&self, prefix: &[u8]) -> u64 {
        self.prefix_counts.get(prefix).copied().unwrap_or(0)
    }

    /// Most frequent prefixes, highest count first
    pub fn top_prefixes(&self, limit: usize) -> Vec<(Vec<u8>, u64)> {
        let mut counts: Vec<(Vec<u8>, u64)> = self
            .prefix_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(limit);
        counts
    }

    /// Entries the sniffer sent for recursion
    pub fn recursed(&self) -> u64 {
        self.recursed
    }

    pub fn is_empty(&self) -> bool {
        self.ignored_types.is_empty() && self.prefix_counts.is_empty()
    }

    /// Emit the end-of-run summary
    pub fn log_summary(&self) {
        info!(
            recursed = self.recursed,
            ignored_types = ?self.ignored_types,
            "sniffer summary"
        );
        for (prefix, count) in self.top_prefixes(20) {
            info!(prefix = %prefix.escape_ascii(), count, "unhelpful prefix");
        }
    }
}

/// Whether the prefix can be rejected without asking the oracle
pub fn cheap_reject(b: &[u8]) -> bool {
    if b.len() < MIN_PREFIX_LEN {
        return true;
    }

    // shebang/comment/#include, html/xml/php, probably text
    if matches!(b[0], b'#' | b'<' | b'\n') {
        return true;
    }

    // c/java license headers, java .class, troff
    if matches!(&b[..2], b"/*" | b"//" | b"\xca\xfe" | b"'\\") {
        return true;
    }

    if &b[..4] == b"\x89PNG" {
        return true;
    }

    matches!(
        &b[..6],
        b"GIF87a" | b"GIF89a" | b"@echo " | b"packag" | b"import" | b"Manife"
    )
}

fn is_archive_type(mime: &str) -> bool {
    ARCHIVE_TYPES.contains(&mime)
}

/// Prefix classifier backed by a MIME oracle
pub struct Sniffer<'a> {
    oracle: &'a dyn MimeOracle,
}

impl<'a> Sniffer<'a> {
    pub fn new(oracle: &'a dyn MimeOracle) -> Self {
        Self { oracle }
    }

    /// Should an entry starting with `prefix` be exploded recursively?
    pub fn should_recurse(&self, prefix: &[u8], diagnostics: &mut SniffDiagnostics) -> bool {
        if cheap_reject(prefix) {
            return false;
        }

        let outer = match self.oracle.mime_type(prefix) {
            Ok(mime) => mime,
            Err(e) => {
                warn!("mime sniffing failed, treating entry as opaque: {}", e);
                return false;
            }
        };

        let major = outer.split('/').next().unwrap_or("");
        if OPAQUE_MAJORS.contains(&major) {
            diagnostics.record_prefix(prefix);
            return false;
        }

        if is_archive_type(&outer) {
            debug!(mime = %outer, "outer archive type");
            diagnostics.recursed += 1;
            return true;
        }

        let inner = match self.oracle.inner_mime_type(prefix) {
            Ok(mime) => mime,
            Err(e) => {
                warn!("compressed mime sniffing failed, treating entry as opaque: {}", e);
                return false;
            }
        };
        if is_archive_type(&inner) {
            debug!(mime = %inner, "inner archive type");
            diagnostics.recursed += 1;
            return true;
        }

        diagnostics.record_ignored(&inner);
        diagnostics.record_prefix(prefix);
        false
    }
}
