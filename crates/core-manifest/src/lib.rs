//! Manifest files for debstash
//!
//! A manifest is the durable record of one exploded archive, pending
//! indexing. This crate owns its wire format and lifecycle:
//!
//! - **Written** atomically by the exploder ([`ManifestWriter`])
//! - **Claimed** by exactly one poller via rename ([`claim`])
//! - **Read** by the indexer ([`ManifestReader`]), which deletes it on success
//!
//! # Example
//!
//! ```no_run
//! use debstash_core_manifest::{ManifestHeader, ManifestWriter, Record};
//! use std::path::Path;
//!
//! let hash = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".parse()?;
//! let mut writer = ManifestWriter::create(Path::new("packed/manifests"), &ManifestHeader::new("pkg.tar", hash))?;
//! writer.write_record(&Record::irregular(vec!["pkg/link".to_string()], 0, 0o777))?;
//! writer.persist()?;
//! # Ok::<(), debstash_core_manifest::Error>(())
//! ```

pub mod claim;
pub mod error;
pub mod hash;
pub mod reader;
pub mod record;
pub mod writer;

// Re-export main types for convenience
pub use claim::{claim, is_pending_manifest, pending_manifests, working_path};
pub use error::{Error, Result};
pub use hash::{ContentHash, CONTENT_HASH_HEX_LEN, CONTENT_HASH_LEN};
pub use reader::ManifestReader;
pub use record::{ManifestHeader, Record};
pub use writer::{manifest_file_name, ManifestWriter};

/// Extension of a published, unclaimed manifest
pub const MANIFEST_EXTENSION: &str = ".manifest";

/// Suffix appended to a manifest's name while an indexer owns it
pub const WORKING_SUFFIX: &str = ".working";
