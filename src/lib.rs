/*!
 * debstash - nested archive ingestion
 *
 * Explodes source packages and arbitrarily nested archives into
 * content-addressed blobs, then:
 * - stores each distinct blob once in size-bucketed shards
 * - records every archive as a manifest of paths and hashes
 * - indexes manifests into a relational catalog with interned,
 *   prefix-compressed path components
 *
 * Version: 0.3.0
 */

pub mod catalog;
pub mod checksum;
pub mod commands;
pub mod config;
pub mod dsc;
pub mod error;
pub mod explode;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod pack;
pub mod sniff;
pub mod store;
pub mod supervise;
pub mod tools;

// Re-export commonly used types
pub use catalog::{BlobState, Catalog, StoreOutcome};
pub use config::{CompressorKind, LogLevel, StashConfig};
pub use error::{Result, StashError};
pub use explode::{explode_archive, ArchiveIdentity, ExplodeSummary, Exploder};
pub use index::{IndexSummary, ManifestIndexer};
pub use ingest::{CycleStats, Ingester};
pub use store::{BlobStore, IngestOutcome, Position, Shard};
pub use supervise::{SelfLauncher, Supervisor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
