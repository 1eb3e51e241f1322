//! Manifest claim protocol
//!
//! A pending manifest is claimed by renaming `<hash>.manifest` to
//! `<hash>.manifest.working`. Rename is atomic, so when several pollers race
//! for the same file exactly one of them wins; the others see `NotFound`.

use crate::error::Result;
use crate::{MANIFEST_EXTENSION, WORKING_SUFFIX};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Whether `path` names an unclaimed manifest
pub fn is_pending_manifest(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| !name.starts_with('.') && name.ends_with(MANIFEST_EXTENSION))
        .unwrap_or(false)
}

/// List unclaimed manifests in `dir`, sorted by name
pub fn pending_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if is_pending_manifest(&path) && entry.file_type()?.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Path a manifest occupies while claimed
pub fn working_path(manifest: &Path) -> PathBuf {
    let mut name = manifest.as_os_str().to_os_string();
    name.push(WORKING_SUFFIX);
    PathBuf::from(name)
}

/// Claim `manifest`. Returns the claimed path, or `None` when another
/// poller got there first.
pub fn claim(manifest: &Path) -> Result<Option<PathBuf>> {
    let taken = working_path(manifest);
    match fs::rename(manifest, &taken) {
        Ok(()) => {
            debug!(manifest = %taken.display(), "claimed manifest");
            Ok(Some(taken))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
