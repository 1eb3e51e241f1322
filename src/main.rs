/*!
 * debstash CLI - Command Line Interface
 *
 * `explode` and `explode-dsc` turn archives into staged blobs plus a
 * manifest, `ingest` moves staged blobs into shards, `index` loads one
 * manifest into the catalog, and `run` supervises ingestion and indexing
 * over a staging root.
 */

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use debstash::{
    commands::init,
    config::{LogLevel, StashConfig},
    dsc::explode_dsc,
    error::{Result, StashError, EXIT_SUCCESS},
    explode::{explode_archive, ArchiveIdentity, BsdtarNormalizer, ExplodeSummary, Exploder},
    logging,
    pack::{compressor_from_config, Packer},
    sniff::FileCommandOracle,
    tools::ToolCommand,
    Ingester, ManifestIndexer, SelfLauncher, Supervisor,
};

#[derive(Parser)]
#[command(name = "debstash")]
#[command(version, about = "Explode nested archives into a deduplicated blob store and catalog", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Staging root (overrides the configuration file)
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Log file path (JSON lines; default: stderr)
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the staging layout and catalog, and write a starter config
    InitCatalog,

    /// Explode one archive into staged blobs and a manifest
    Explode {
        /// Archive to explode
        archive: PathBuf,

        /// Package name recorded in the manifest (default: file name)
        #[arg(long)]
        name: Option<String>,

        /// Package version recorded in the manifest
        #[arg(long = "pkg-version", value_name = "VERSION")]
        version: Option<String>,
    },

    /// Explode a Debian source package described by a .dsc file
    ExplodeDsc {
        /// The .dsc control file; referenced files must sit beside it
        dsc: PathBuf,
    },

    /// Move staged blobs into shards
    Ingest {
        /// Run a single scan instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Index one manifest into the catalog
    Index {
        /// Manifest file (usually a claimed `.working` file)
        manifest: PathBuf,
    },

    /// Supervise ingestion and indexing until a fatal error
    Run,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match &cli.command {
        Commands::InitCatalog => {
            let report = init::run_init(&config, cli.config.as_deref())
                .map_err(|e| StashError::Config(format!("Initialization failed: {:#}", e)))?;
            init::print_summary(&report);
            Ok(())
        }
        Commands::Explode {
            archive,
            name,
            version,
        } => {
            config.ensure_layout()?;
            let identity = ArchiveIdentity {
                name: name.clone(),
                version: version.clone(),
            };
            let summary = with_exploder(&config, |exploder| {
                explode_archive(exploder, archive, identity, &config.manifest_dir())
            })?;
            print_explode_summary(&summary);
            Ok(())
        }
        Commands::ExplodeDsc { dsc } => {
            config.ensure_layout()?;
            let summary = with_exploder(&config, |exploder| {
                explode_dsc(exploder, dsc, &config.manifest_dir())
            })?;
            print_explode_summary(&summary);
            Ok(())
        }
        Commands::Ingest { once } => {
            config.ensure_layout()?;
            let ingester = Ingester::from_config(&config)?;
            if *once {
                let stats = ingester.run_cycle()?;
                println!(
                    "queued {} stored {} duplicates {} skipped {} failed {}",
                    stats.queued, stats.stored, stats.duplicates, stats.skipped, stats.failed
                );
                Ok(())
            } else {
                ingester.run_forever(Duration::from_secs(config.poll_interval_secs))
            }
        }
        Commands::Index { manifest } => {
            let mut indexer = ManifestIndexer::from_config(&config)?;
            let summary = indexer.index_manifest(manifest)?;
            println!(
                "container {}: {} files ({} irregular, {} conflicts)",
                summary.container, summary.files, summary.irregular, summary.conflicts
            );
            Ok(())
        }
        Commands::Run => {
            config.ensure_layout()?;
            let ingester = Ingester::from_config(&config)?;
            let launcher = SelfLauncher::current(child_args(&cli))?;
            Supervisor::new(ingester, launcher, &config).run()
        }
    }
}

/// File configuration with command-line overrides applied
fn load_config(cli: &Cli) -> Result<StashConfig> {
    let mut config = match cli.config {
        Some(ref path) if path.exists() => StashConfig::from_file(path)?,
        // `init-catalog` writes the file, every other command needs it
        Some(ref path) if !matches!(cli.command, Commands::InitCatalog) => {
            return Err(StashError::SourceNotFound(path.clone()));
        }
        _ => StashConfig::default(),
    };

    if let Some(ref root) = cli.root {
        config.root = root.clone();
    }
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    if cli.log_file.is_some() {
        config.log_file = cli.log_file.clone();
    }
    config.verbose |= cli.verbose;

    config.validate()?;
    Ok(config)
}

/// Global flags repeated for indexer subprocesses so they see the same
/// configuration as the supervisor
fn child_args(cli: &Cli) -> Vec<OsString> {
    let mut args = Vec::new();
    let mut push = |flag: &str, path: &Path| {
        args.push(OsString::from(flag));
        args.push(path.as_os_str().to_owned());
    };
    if let Some(ref path) = cli.config {
        push("--config", path);
    }
    if let Some(ref root) = cli.root {
        push("--root", root);
    }
    if let Some(ref log_file) = cli.log_file {
        push("--log-file", log_file);
    }
    if let Some(level) = cli.log_level {
        if let Some(value) = level.to_possible_value() {
            args.push(OsString::from("--log-level"));
            args.push(OsString::from(value.get_name()));
        }
    }
    if cli.verbose {
        args.push(OsString::from("--verbose"));
    }
    args
}

fn with_exploder<T>(config: &StashConfig, f: impl FnOnce(&Exploder<'_>) -> Result<T>) -> Result<T> {
    let normalizer = BsdtarNormalizer::new(ToolCommand::from_argv(&config.normalizer_command)?);
    let oracle = FileCommandOracle::new(ToolCommand::from_argv(&config.mime_command)?);
    let compressor = compressor_from_config(config)?;
    let packer = Packer::new(config.root.clone(), compressor.as_ref());
    let exploder = Exploder::new(&normalizer, &oracle, &packer, config);
    f(&exploder)
}

fn print_explode_summary(summary: &ExplodeSummary) {
    println!(
        "{} {}: {} records -> {}",
        summary.header.name,
        summary.header.hash,
        summary.records,
        summary.manifest.display()
    );
}
