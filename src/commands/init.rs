//! Staging root initialization
//!
//! Creates the directory layout and catalog schema, and writes a starter
//! configuration file when none exists yet.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::catalog::Catalog;
use crate::config::StashConfig;

/// What `init` created or found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub root: PathBuf,
    pub catalog: PathBuf,
    pub blobs: u64,
    /// Set when a new configuration file was written
    pub config_written: Option<PathBuf>,
}

/// Prepare a staging root. Safe to run repeatedly: existing directories,
/// tables and configuration files are left as they are.
pub fn run_init(config: &StashConfig, config_path: Option<&Path>) -> Result<InitReport> {
    config.validate().context("Invalid configuration")?;
    config
        .ensure_layout()
        .with_context(|| format!("Failed to create layout under {}", config.root.display()))?;

    let catalog = Catalog::from_config(config).with_context(|| {
        format!("Failed to open catalog {}", config.catalog_path().display())
    })?;
    let blobs = catalog.blob_count()?;

    let config_written = match config_path {
        Some(path) if !path.exists() => {
            config
                .to_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to save configuration: {}", e))?;
            Some(path.to_path_buf())
        }
        _ => None,
    };

    Ok(InitReport {
        root: config.root.clone(),
        catalog: config.catalog_path(),
        blobs,
        config_written,
    })
}

pub fn print_summary(report: &InitReport) {
    println!("staging root: {}", report.root.display());
    println!("catalog:      {} ({} blobs)", report.catalog.display(), report.blobs);
    if let Some(path) = &report.config_written {
        println!("config:       {} (new)", path.display());
    }
}
