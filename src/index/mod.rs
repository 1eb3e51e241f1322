/*!
 * Manifest indexer
 *
 * Turns one claimed manifest into a container row plus one file row per
 * stored record. Each file row carries the blob position and the record's
 * path as an array of interned, prefix-compressed components.
 */

pub mod pathtree;
pub mod pool;

use std::fs;
use std::path::Path;

use debstash_core_manifest::ManifestReader;
use tracing::{debug, info, warn};

use crate::catalog::{BlobState, Catalog};
use crate::config::StashConfig;
use crate::error::{Result, StashError};
use crate::store::HashQuarters;

pub use pathtree::{common_prefix, longest_common_prefix, PathTree, TreeConflict};
pub use pool::StringPool;

/// Outcome of indexing one manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    pub container: i64,
    pub files: u64,
    /// Records without content (symlinks, devices)
    pub irregular: u64,
    /// Records dropped because their path collided with another
    pub conflicts: u64,
}

pub struct ManifestIndexer {
    catalog: Catalog,
    pool: StringPool,
}

impl ManifestIndexer {
    /// `catalog` carries the manifest transaction; `pool` is a second,
    /// autocommit connection for path components
    pub fn new(catalog: Catalog, pool: StringPool) -> Self {
        Self { catalog, pool }
    }

    pub fn from_config(config: &StashConfig) -> Result<Self> {
        let catalog = Catalog::from_config(config)?;
        let pool = StringPool::new(Catalog::from_config(config)?)?;
        Ok(Self::new(catalog, pool))
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Index one manifest and delete it once its rows are committed
    pub fn index_manifest(&mut self, path: &Path) -> Result<IndexSummary> {
        let reader = ManifestReader::open(path)?;
        let info = reader.info().clone();
        let header = reader.header().clone();
        debug!(manifest = %path.display(), name = %header.name, "indexing");

        let mut tree = PathTree::new();
        let mut irregular = 0;
        let mut conflicts = 0;
        for record in reader {
            let record = record?;
            let Some(hash) = record.hash else {
                irregular += 1;
                continue;
            };

            let quarters = HashQuarters::from_hash(&hash);
            let pos = match self.catalog.blob_state(&quarters)? {
                BlobState::Stored(pos) => pos,
                BlobState::Missing | BlobState::Reserved => {
                    return Err(StashError::UnstoredBlob {
                        hash: hash.to_hex(),
                    });
                }
            };

            if let Err(conflict) = tree.insert(&record.path, pos) {
                warn!(manifest = %path.display(), "{}", conflict);
                conflicts += 1;
            }
        }

        let mut rows = Vec::with_capacity(tree.len());
        for (segments, pos) in tree.into_compressed() {
            rows.push((pos, self.pool.ids(&segments)?));
        }

        let tx = self.catalog.begin_index()?;
        let container = tx.insert_container(&info)?;
        for (pos, ids) in &rows {
            tx.insert_file(container, *pos, ids)?;
        }
        tx.commit()?;

        fs::remove_file(path)?;

        let summary = IndexSummary {
            container,
            files: rows.len() as u64,
            irregular,
            conflicts,
        };
        info!(
            name = %header.name,
            container,
            files = summary.files,
            irregular,
            conflicts,
            "manifest indexed"
        );
        Ok(summary)
    }
}
