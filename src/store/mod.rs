/*!
 * Blob store
 *
 * Moves staged blobs into append-only shards and records where they went.
 * Each staged blob walks a small state machine keyed by `(length, hash)`:
 *
 * ```text
 * Staged ──insert conflict──▶ Duplicate (staged file deleted)
 *   │
 *   └──inserted──▶ Reserved ──shard append + update──▶ Stored (staged file deleted)
 * ```
 */

pub mod shard;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use debstash_core_manifest::{ContentHash, CONTENT_HASH_HEX_LEN};
use tracing::{debug, error, info};

use crate::catalog::{Catalog, StoreOutcome};
use crate::error::{Result, StashError};

pub use shard::{ExternalShardAppender, ShardAppender};

/// Smallest and largest size bucket
pub const MIN_BUCKET: u32 = 2;
pub const MAX_BUCKET: u32 = 9;

/// Shard records are padded to this boundary; the low bits of a position
/// carry the shard id
pub const SHARD_ALIGNMENT: u64 = 16;

/// A SHA-256 split into four big-endian signed 64-bit quarters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashQuarters(pub [i64; 4]);

impl HashQuarters {
    /// Split 64 lowercase hex digits; anything else is not a hash
    pub fn decompose(hex: &str) -> Option<Self> {
        let lower_hex = |b: u8| b.is_ascii_digit() || (b'a'..=b'f').contains(&b);
        if hex.len() != CONTENT_HASH_HEX_LEN || !hex.bytes().all(lower_hex) {
            return None;
        }
        let mut quarters = [0i64; 4];
        for (i, quarter) in quarters.iter_mut().enumerate() {
            let digits = &hex[i * 16..(i + 1) * 16];
            *quarter = u64::from_str_radix(digits, 16).ok()? as i64;
        }
        Some(Self(quarters))
    }

    pub fn from_hash(hash: &ContentHash) -> Self {
        let mut quarters = [0i64; 4];
        for (quarter, chunk) in quarters.iter_mut().zip(hash.as_bytes().chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *quarter = i64::from_be_bytes(bytes);
        }
        Self(quarters)
    }

    /// Lowercase hex, inverse of [`HashQuarters::decompose`]
    pub fn recompose(&self) -> String {
        self.0.iter().map(|q| format!("{:016x}", *q as u64)).collect()
    }

    pub fn to_content_hash(&self) -> ContentHash {
        let mut bytes = [0u8; 32];
        for (chunk, quarter) in bytes.chunks_exact_mut(8).zip(self.0) {
            chunk.copy_from_slice(&quarter.to_be_bytes());
        }
        ContentHash::from_bytes(bytes)
    }
}

/// Catalog identity of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobKey {
    pub len: i64,
    pub quarters: HashQuarters,
}

/// Size bucket: decimal digit count minus one, clamped to 2..=9
pub fn bucket(size: u64) -> u32 {
    if size == 0 {
        return MIN_BUCKET;
    }
    size.ilog10().clamp(MIN_BUCKET, MAX_BUCKET)
}

/// One of the sixteen shards, chosen by text class and size bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub text: bool,
    pub bucket: u32,
}

impl Shard {
    pub fn for_blob(text: bool, size: u64) -> Self {
        Self {
            text,
            bucket: bucket(size),
        }
    }

    /// `text-<bucket>` or `bin-<bucket>`
    pub fn name(&self) -> String {
        format!("{}-{}", if self.text { "text" } else { "bin" }, self.bucket)
    }

    /// 0..=7 for text shards, 8..=15 for binary ones
    pub fn id(&self) -> u8 {
        let id = (self.bucket - MIN_BUCKET) as u8;
        if self.text {
            id
        } else {
            id + 8
        }
    }
}

/// Shard offset and shard id packed into one integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position(i64);

impl Position {
    pub fn encode(offset: u64, shard_id: u8) -> Result<Self> {
        if offset % SHARD_ALIGNMENT != 0 {
            return Err(StashError::ShardContract(format!(
                "offset {} is not {}-byte aligned",
                offset, SHARD_ALIGNMENT
            )));
        }
        if u64::from(shard_id) >= SHARD_ALIGNMENT {
            return Err(StashError::ShardContract(format!("shard id {} out of range", shard_id)));
        }
        let pos = i64::try_from(offset + u64::from(shard_id))
            .map_err(|_| StashError::ShardContract(format!("offset {} out of range", offset)))?;
        Ok(Self(pos))
    }

    pub fn from_raw(pos: i64) -> Self {
        Self(pos)
    }

    pub fn get(&self) -> i64 {
        self.0
    }

    /// `(shard_id, offset)`
    pub fn decode(&self) -> (u8, u64) {
        let raw = self.0 as u64;
        ((raw % SHARD_ALIGNMENT) as u8, raw - raw % SHARD_ALIGNMENT)
    }
}

/// What happened to one staged blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { position: Position },
    Duplicate,
    /// An earlier shard append for this blob failed; the staged file is
    /// kept as the only copy
    Unstored,
    /// The staged name is not a hash
    Skipped,
}

/// Staging root plus the shard appender; shared by every ingestion worker
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    appender: Arc<dyn ShardAppender>,
}

impl BlobStore {
    pub fn new<P: Into<PathBuf>>(root: P, appender: Arc<dyn ShardAppender>) -> Self {
        Self {
            root: root.into(),
            appender,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staged_path(&self, text: bool, hex: &str) -> PathBuf {
        self.root.join(if text { "text" } else { "bin" }).join(hex)
    }

    /// Move one staged blob into its shard, or discard it as a duplicate
    pub fn ingest(&self, catalog: &mut Catalog, text: bool, hex: &str) -> Result<IngestOutcome> {
        let Some(quarters) = HashQuarters::decompose(hex) else {
            debug!(name = hex, "not a staged blob name, skipping");
            return Ok(IngestOutcome::Skipped);
        };
        let staged = self.staged_path(text, hex);
        let len = fs::metadata(&staged)?.len();
        let hash = quarters.to_content_hash();
        let shard = Shard::for_blob(text, len);
        let key = BlobKey {
            len: len as i64,
            quarters,
        };

        let outcome = catalog.store_blob(&key, || {
            let offset = self.appender.append(&hash, &shard.name(), &staged)?;
            Ok(Position::encode(offset, shard.id())?.get())
        })?;

        if let StoreOutcome::Unstored = outcome {
            error!(
                hash = hex,
                staged = %staged.display(),
                "blob reserved but never stored, keeping staged file"
            );
            return Ok(IngestOutcome::Unstored);
        }

        fs::remove_file(&staged)?;
        match outcome {
            StoreOutcome::Duplicate => {
                debug!(hash = hex, "duplicate blob discarded");
                Ok(IngestOutcome::Duplicate)
            }
            StoreOutcome::Stored(pos) => {
                info!(hash = hex, shard = %shard.name(), pos, "blob stored");
                Ok(IngestOutcome::Stored {
                    position: Position::from_raw(pos),
                })
            }
            StoreOutcome::Unstored => Ok(IngestOutcome::Unstored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BlobState;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    /// Appends to an in-memory shard map, padding like the real appender
    #[derive(Default)]
    struct MemoryAppender {
        shards: Mutex<Vec<(String, u64)>>,
    }

    impl ShardAppender for MemoryAppender {
        fn append(&self, _hash: &ContentHash, shard_name: &str, staged: &Path) -> Result<u64> {
            let len = fs::metadata(staged)?.len();
            let mut shards = self.shards.lock().unwrap();
            let offset = shards
                .iter()
                .filter(|(name, _)| name == shard_name)
                .map(|(_, len)| len.div_ceil(SHARD_ALIGNMENT) * SHARD_ALIGNMENT)
                .sum();
            shards.push((shard_name.to_string(), len));
            Ok(offset)
        }
    }

    struct FailingAppender;

    impl ShardAppender for FailingAppender {
        fn append(&self, _hash: &ContentHash, _shard_name: &str, _staged: &Path) -> Result<u64> {
            Err(StashError::tool_output("catfight", "shard locked"))
        }
    }

    fn setup() -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("text")).unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        let catalog =
            Catalog::open(&dir.path().join("catalog.sqlite"), Duration::from_secs(5)).unwrap();
        (dir, catalog)
    }

    fn stage(dir: &Path, text: bool, hex: &str, bytes: &[u8]) {
        let sub = if text { "text" } else { "bin" };
        fs::write(dir.join(sub).join(hex), bytes).unwrap();
    }

    #[test]
    fn test_decompose_known_hash() {
        let quarters = HashQuarters::decompose(EMPTY).unwrap();
        assert_eq!(
            quarters.0,
            [
                -2039914840885289964,
                -7278955230309402332,
                2859295262623109964,
                -6587190536697628587
            ]
        );
        assert_eq!(quarters.recompose(), EMPTY);
    }

    #[test]
    fn test_quarters_agree_with_content_hash() {
        let hash: ContentHash = EMPTY.parse().unwrap();
        let quarters = HashQuarters::from_hash(&hash);
        assert_eq!(Some(quarters), HashQuarters::decompose(EMPTY));
        assert_eq!(quarters.to_content_hash(), hash);
    }

    #[test]
    fn test_decompose_rejects_non_hashes() {
        assert!(HashQuarters::decompose("").is_none());
        assert!(HashQuarters::decompose(&EMPTY[1..]).is_none());
        assert!(HashQuarters::decompose(&EMPTY.replace('e', "g")).is_none());
        assert!(HashQuarters::decompose(&format!("+{}", &EMPTY[1..])).is_none());
        assert!(HashQuarters::decompose(&EMPTY.to_uppercase()).is_none());
    }

    #[test]
    fn test_recompose_round_trips() {
        let mut hexes: Vec<String> = (0u32..256)
            .map(|i| {
                let mut hasher = crate::checksum::StreamingHasher::new();
                hasher.update(&i.to_le_bytes());
                hasher.finalize().to_hex()
            })
            .collect();
        hexes.push("0".repeat(64));
        hexes.push("f".repeat(64));
        hexes.push("8000000000000000".repeat(4));
        hexes.push("7fffffffffffffff".repeat(4));

        let mut negative = 0;
        for hex in &hexes {
            let quarters = HashQuarters::decompose(hex).unwrap();
            negative += quarters.0.iter().filter(|q| **q < 0).count();
            assert_eq!(&quarters.recompose(), hex);
            assert_eq!(quarters.to_content_hash().to_hex(), *hex);
        }
        assert!(negative > 0);
    }

    #[test]
    fn test_bucket() {
        assert_eq!(bucket(0), 2);
        assert_eq!(bucket(5), 2);
        assert_eq!(bucket(900), 2);
        assert_eq!(bucket(2000), 3);
        assert_eq!(bucket(1_000_000), 6);
        assert_eq!(bucket(u64::MAX), 9);
    }

    #[test]
    fn test_shard_names_and_ids() {
        let small_text = Shard::for_blob(true, 10);
        assert_eq!(small_text.name(), "text-2");
        assert_eq!(small_text.id(), 0);

        let huge_bin = Shard::for_blob(false, 10_000_000_000);
        assert_eq!(huge_bin.name(), "bin-9");
        assert_eq!(huge_bin.id(), 15);
    }

    #[test]
    fn test_position_encoding() {
        let pos = Position::encode(4096, 11).unwrap();
        assert_eq!(pos.get(), 4107);
        assert_eq!(pos.decode(), (11, 4096));

        assert!(matches!(
            Position::encode(4097, 0),
            Err(StashError::ShardContract(_))
        ));
        assert!(matches!(
            Position::encode(0, 16),
            Err(StashError::ShardContract(_))
        ));
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let (dir, mut catalog) = setup();
        let appender = Arc::new(MemoryAppender::default());
        let store = BlobStore::new(dir.path(), appender.clone());

        stage(dir.path(), true, EMPTY, b"compressed bytes");
        let first = store.ingest(&mut catalog, true, EMPTY).unwrap();
        assert!(matches!(first, IngestOutcome::Stored { .. }));
        assert!(!dir.path().join("text").join(EMPTY).exists());

        stage(dir.path(), true, EMPTY, b"compressed bytes");
        let second = store.ingest(&mut catalog, true, EMPTY).unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);
        assert!(!dir.path().join("text").join(EMPTY).exists());

        assert_eq!(catalog.blob_count().unwrap(), 1);
        assert_eq!(appender.shards.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_positions_carry_shard_ids() {
        let (dir, mut catalog) = setup();
        let store = BlobStore::new(dir.path(), Arc::new(MemoryAppender::default()));

        let a = format!("{}{}", "a".repeat(63), "1");
        let b = format!("{}{}", "b".repeat(63), "2");
        stage(dir.path(), false, &a, &[0u8; 20]);
        stage(dir.path(), false, &b, &[0u8; 30]);

        let IngestOutcome::Stored { position: pa } = store.ingest(&mut catalog, false, &a).unwrap()
        else {
            panic!("expected stored")
        };
        let IngestOutcome::Stored { position: pb } = store.ingest(&mut catalog, false, &b).unwrap()
        else {
            panic!("expected stored")
        };
        assert_eq!(pa.decode(), (8, 0));
        assert_eq!(pb.decode(), (8, 32));

        let quarters = HashQuarters::decompose(&b).unwrap();
        assert_eq!(catalog.blob_state(&quarters).unwrap(), BlobState::Stored(pb.get()));
    }

    #[test]
    fn test_append_failure_leaves_reservation() {
        let (dir, mut catalog) = setup();
        let store = BlobStore::new(dir.path(), Arc::new(FailingAppender));
        stage(dir.path(), true, EMPTY, b"x");

        let err = store.ingest(&mut catalog, true, EMPTY).unwrap_err();
        assert!(matches!(err, StashError::ToolOutput { .. }));

        let quarters = HashQuarters::decompose(EMPTY).unwrap();
        assert_eq!(catalog.blob_state(&quarters).unwrap(), BlobState::Reserved);
        assert!(dir.path().join("text").join(EMPTY).exists());
    }

    #[test]
    fn test_failed_append_is_not_treated_as_duplicate() {
        let (dir, mut catalog) = setup();
        stage(dir.path(), true, EMPTY, b"only copy");

        let failing = BlobStore::new(dir.path(), Arc::new(FailingAppender));
        assert!(failing.ingest(&mut catalog, true, EMPTY).is_err());

        // next cycle, with a working appender
        let appender = Arc::new(MemoryAppender::default());
        let store = BlobStore::new(dir.path(), appender.clone());
        let outcome = store.ingest(&mut catalog, true, EMPTY).unwrap();
        assert_eq!(outcome, IngestOutcome::Unstored);
        assert!(dir.path().join("text").join(EMPTY).exists());
        assert!(appender.shards.lock().unwrap().is_empty());

        let quarters = HashQuarters::decompose(EMPTY).unwrap();
        assert_eq!(catalog.blob_state(&quarters).unwrap(), BlobState::Reserved);
    }

    #[test]
    fn test_malformed_name_is_skipped() {
        let (dir, mut catalog) = setup();
        let store = BlobStore::new(dir.path(), Arc::new(FailingAppender));
        stage(dir.path(), true, "README", b"stray");

        assert_eq!(
            store.ingest(&mut catalog, true, "README").unwrap(),
            IngestOutcome::Skipped
        );
        assert!(dir.path().join("text").join("README").exists());
        assert_eq!(catalog.blob_count().unwrap(), 0);
    }
}
