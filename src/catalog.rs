/*!
 * Catalog: the relational index over blobs, containers and files
 *
 * Backed by SQLite in WAL mode. Every process and every worker thread owns
 * its own connection; a busy timeout makes writers queue for the write lock
 * instead of failing.
 */

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::config::StashConfig;
use crate::error::Result;
use crate::store::{BlobKey, HashQuarters};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blob (
    len INTEGER NOT NULL,
    h0 INTEGER NOT NULL,
    h1 INTEGER NOT NULL,
    h2 INTEGER NOT NULL,
    h3 INTEGER NOT NULL,
    pos INTEGER,
    UNIQUE (len, h0, h1, h2, h3)
);
CREATE INDEX IF NOT EXISTS blob_hash ON blob (h0, h1, h2, h3);

CREATE TABLE IF NOT EXISTS path_component (
    id INTEGER PRIMARY KEY,
    path TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS container (
    id INTEGER PRIMARY KEY,
    info TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file (
    container INTEGER NOT NULL REFERENCES container (id),
    pos INTEGER NOT NULL,
    paths TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS file_container ON file (container);
";

/// Result of trying to store a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Someone already stored this `(len, hash)`
    Duplicate,
    /// A row exists but its shard append never completed
    Unstored,
    /// Newly stored at this position
    Stored(i64),
}

/// What the catalog knows about a hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Missing,
    /// Row exists but no position was ever recorded
    Reserved,
    Stored(i64),
}

fn blob_state(conn: &Connection, quarters: &HashQuarters) -> Result<BlobState> {
    let [h0, h1, h2, h3] = quarters.0;
    let pos: Option<Option<i64>> = conn
        .query_row(
            "SELECT pos FROM blob WHERE h0 = ?1 AND h1 = ?2 AND h2 = ?3 AND h3 = ?4
             ORDER BY pos IS NULL LIMIT 1",
            params![h0, h1, h2, h3],
            |row| row.get(0),
        )
        .optional()?;

    Ok(match pos {
        None => BlobState::Missing,
        Some(None) => BlobState::Reserved,
        Some(Some(pos)) => BlobState::Stored(pos),
    })
}

/// One catalog connection
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (creating if needed) the catalog database
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), journal_mode = %mode, "catalog opened");
        Ok(Self { conn })
    }

    pub fn from_config(config: &StashConfig) -> Result<Self> {
        Self::open(
            &config.catalog_path(),
            Duration::from_secs(config.catalog_busy_timeout_secs),
        )
    }

    /// Reserve `(len, hash)` and, if the reservation is new, run `append`
    /// and record the position it returns.
    ///
    /// The reservation and the position update are separate autocommit
    /// statements; no write lock is held while `append` runs. If `append`
    /// fails the row stays reserved without a position.
    pub fn store_blob<F>(&mut self, key: &BlobKey, append: F) -> Result<StoreOutcome>
    where
        F: FnOnce() -> Result<i64>,
    {
        let [h0, h1, h2, h3] = key.quarters.0;
        let inserted = self
            .conn
            .query_row(
                "INSERT INTO blob (len, h0, h1, h2, h3) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT DO NOTHING
                 RETURNING 1",
                params![key.len, h0, h1, h2, h3],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !inserted {
            return Ok(match self.blob_position(key)? {
                Some(_) => StoreOutcome::Duplicate,
                None => StoreOutcome::Unstored,
            });
        }

        let pos = append()?;
        self.conn.execute(
            "UPDATE blob SET pos = ?1
             WHERE len = ?2 AND h0 = ?3 AND h1 = ?4 AND h2 = ?5 AND h3 = ?6",
            params![pos, key.len, h0, h1, h2, h3],
        )?;
        Ok(StoreOutcome::Stored(pos))
    }

    /// Position of the exact `(len, hash)` row, `None` while unstored
    fn blob_position(&self, key: &BlobKey) -> Result<Option<i64>> {
        let [h0, h1, h2, h3] = key.quarters.0;
        let pos: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT pos FROM blob
                 WHERE len = ?1 AND h0 = ?2 AND h1 = ?3 AND h2 = ?4 AND h3 = ?5",
                params![key.len, h0, h1, h2, h3],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pos.flatten())
    }

    /// Look a blob up by hash alone
    pub fn blob_state(&self, quarters: &HashQuarters) -> Result<BlobState> {
        blob_state(&self.conn, quarters)
    }

    pub fn blob_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM blob", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Insert-or-lookup a path component, outside any transaction
    pub fn intern(&self, path: &str) -> Result<i64> {
        let inserted: Option<i64> = self
            .conn
            .query_row(
                "INSERT INTO path_component (path) VALUES (?1)
                 ON CONFLICT DO NOTHING
                 RETURNING id",
                params![path],
                |row| row.get(0),
            )
            .optional()?;

        match inserted {
            Some(id) => Ok(id),
            None => Ok(self.conn.query_row(
                "SELECT id FROM path_component WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )?),
        }
    }

    /// Start the write transaction one manifest is indexed in
    pub fn begin_index(&mut self) -> Result<IndexTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(IndexTransaction { tx })
    }
}

/// Container and file rows for one manifest; nothing is visible until
/// [`IndexTransaction::commit`]
pub struct IndexTransaction<'c> {
    tx: rusqlite::Transaction<'c>,
}

impl IndexTransaction<'_> {
    pub fn insert_container(&self, info: &Value) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO container (info) VALUES (?1)",
            params![serde_json::to_string(info)?],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn insert_file(&self, container: i64, pos: i64, paths: &[i64]) -> Result<()> {
        self.tx.execute(
            "INSERT INTO file (container, pos, paths) VALUES (?1, ?2, ?3)",
            params![container, pos, serde_json::to_string(paths)?],
        )?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

/// Read-back used to check what the indexer wrote
#[cfg(test)]
impl Catalog {
    pub(crate) fn path_component(&self, id: i64) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT path FROM path_component WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub(crate) fn container_info(&self, id: i64) -> Result<Option<Value>> {
        let info: Option<String> = self
            .conn
            .query_row(
                "SELECT info FROM container WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        info.map(|text| serde_json::from_str(&text).map_err(crate::error::StashError::from))
            .transpose()
    }

    /// `(pos, path component ids)` for every file of a container, in
    /// insertion order
    pub(crate) fn container_files(&self, container: i64) -> Result<Vec<(i64, Vec<i64>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pos, paths FROM file WHERE container = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![container], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut files = Vec::new();
        for row in rows {
            let (pos, paths) = row?;
            files.push((pos, serde_json::from_str(&paths)?));
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StashError;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Catalog {
        Catalog::open(&dir.path().join("catalog.sqlite"), Duration::from_secs(5)).unwrap()
    }

    fn key(len: i64, seed: i64) -> BlobKey {
        BlobKey {
            len,
            quarters: HashQuarters([seed, -seed, seed * 3, i64::MIN + seed]),
        }
    }

    #[test]
    fn test_store_then_duplicate() {
        let dir = TempDir::new().unwrap();
        let mut catalog = open(&dir);

        let stored = catalog.store_blob(&key(10, 1), || Ok(48)).unwrap();
        assert_eq!(stored, StoreOutcome::Stored(48));

        let dup = catalog
            .store_blob(&key(10, 1), || panic!("duplicate must not append"))
            .unwrap();
        assert_eq!(dup, StoreOutcome::Duplicate);

        // same hash, different length is a distinct row
        let other = catalog.store_blob(&key(11, 1), || Ok(64)).unwrap();
        assert_eq!(other, StoreOutcome::Stored(64));
        assert_eq!(catalog.blob_count().unwrap(), 2);
    }

    #[test]
    fn test_failed_append_keeps_reservation() {
        let dir = TempDir::new().unwrap();
        let mut catalog = open(&dir);

        let err = catalog
            .store_blob(&key(5, 7), || Err(StashError::tool_output("catfight", "boom")))
            .unwrap_err();
        assert!(matches!(err, StashError::ToolOutput { .. }));
        assert_eq!(
            catalog.blob_state(&key(5, 7).quarters).unwrap(),
            BlobState::Reserved
        );

        // not retried, and not mistaken for a stored duplicate
        let again = catalog
            .store_blob(&key(5, 7), || panic!("reserved row must not append"))
            .unwrap();
        assert_eq!(again, StoreOutcome::Unstored);
        assert_eq!(
            catalog.blob_state(&key(5, 7).quarters).unwrap(),
            BlobState::Reserved
        );
    }

    #[test]
    fn test_append_runs_without_holding_the_write_lock() {
        let dir = TempDir::new().unwrap();
        let mut catalog = open(&dir);
        let mut other = Catalog::open(
            &dir.path().join("catalog.sqlite"),
            Duration::from_millis(100),
        )
        .unwrap();

        // another writer gets through while the first append is in flight
        let outcome = catalog
            .store_blob(&key(8, 1), || {
                let inner = other.store_blob(&key(8, 2), || Ok(32))?;
                assert_eq!(inner, StoreOutcome::Stored(32));
                let tx = other.begin_index()?;
                tx.insert_container(&json!({"name": "concurrent"}))?;
                tx.commit()?;
                Ok(16)
            })
            .unwrap();
        assert_eq!(outcome, StoreOutcome::Stored(16));
        assert_eq!(catalog.blob_count().unwrap(), 2);
    }

    #[test]
    fn test_blob_state_prefers_stored_row() {
        let dir = TempDir::new().unwrap();
        let mut catalog = open(&dir);
        assert_eq!(
            catalog.blob_state(&key(1, 2).quarters).unwrap(),
            BlobState::Missing
        );

        let _ = catalog.store_blob(&key(1, 2), || Err(StashError::Config("x".into())));
        catalog.store_blob(&key(2, 2), || Ok(96)).unwrap();
        assert_eq!(
            catalog.blob_state(&key(1, 2).quarters).unwrap(),
            BlobState::Stored(96)
        );
    }

    #[test]
    fn test_intern_is_stable() {
        let dir = TempDir::new().unwrap();
        let catalog = open(&dir);
        let a = catalog.intern("usr/share/").unwrap();
        let b = catalog.intern("doc").unwrap();
        assert_ne!(a, b);
        assert_eq!(catalog.intern("usr/share/").unwrap(), a);
        assert_eq!(catalog.path_component(b).unwrap().as_deref(), Some("doc"));
    }

    #[test]
    fn test_index_transaction_commit_and_rollback() {
        let dir = TempDir::new().unwrap();
        let mut catalog = open(&dir);

        {
            let tx = catalog.begin_index().unwrap();
            let id = tx.insert_container(&json!({"name": "dropped"})).unwrap();
            tx.insert_file(id, 16, &[1, 2]).unwrap();
            // dropped without commit
        }

        let tx = catalog.begin_index().unwrap();
        let id = tx.insert_container(&json!({"name": "kept"})).unwrap();
        tx.insert_file(id, 32, &[3, 4, 5]).unwrap();
        tx.commit().unwrap();

        assert_eq!(catalog.container_info(id).unwrap(), Some(json!({"name": "kept"})));
        assert_eq!(catalog.container_files(id).unwrap(), vec![(32, vec![3, 4, 5])]);
    }

    #[test]
    fn test_second_connection_sees_commits() {
        let dir = TempDir::new().unwrap();
        let mut writer = open(&dir);
        let reader = open(&dir);
        writer.store_blob(&key(3, 9), || Ok(0)).unwrap();
        assert_eq!(
            reader.blob_state(&key(3, 9).quarters).unwrap(),
            BlobState::Stored(0)
        );
    }
}
