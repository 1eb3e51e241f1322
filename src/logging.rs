/*!
 * Logging and tracing initialization
 *
 * The supervisor and the indexer subprocesses it launches share one
 * configuration, so with `log_file` set they all append JSON lines to the
 * same file; at debug level each process logs its pid once at startup.
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::StashConfig;
use crate::error::{Result, StashError};

/// Crates whose events pass the default filter
const LOG_TARGETS: [&str; 2] = ["debstash", "debstash_core_manifest"];

/// Install the global subscriber: compact stderr output, or JSON lines
/// appended to `log_file`. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &StashConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(effective_level(config))))
        .map_err(|e| StashError::Config(format!("Failed to create log filter: {}", e)))?;

    match config.log_file {
        Some(ref log_path) => init_json_logging(log_path, env_filter)?,
        None => init_stderr_logging(env_filter),
    }
    tracing::debug!(pid = std::process::id(), "logging initialized");
    Ok(())
}

fn effective_level(config: &StashConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.to_tracing_level()
    }
}

fn default_directives(level: Level) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Stdout is reserved for command output
fn init_stderr_logging(env_filter: EnvFilter) {
    // ingestion workers are named `ingest-N`
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_names(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn init_json_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    // several processes append to the same file
    let file = File::options()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            StashError::Config(format!("Failed to open log file {}: {}", log_path.display(), e))
        })?;

    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    Ok(())
}

/// Route events to the test harness; safe to call from every test
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(Level::DEBUG)));

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_test_writer().without_time().compact())
            .try_init();
    });
}
