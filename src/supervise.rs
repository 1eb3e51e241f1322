/*!
 * Supervisor control loop
 *
 * Alternates ingestion cycles with launching indexer subprocesses for
 * pending manifests. Manifests are claimed by renaming them to
 * `<name>.working`, so several supervisors may share a staging root.
 */

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use debstash_core_manifest::{claim, pending_manifests};
use tracing::{debug, error, info, warn};

use crate::config::StashConfig;
use crate::error::{Result, StashError};
use crate::ingest::Ingester;

/// Starts an indexer for one claimed manifest
pub trait IndexLauncher {
    fn launch(&self, manifest: &Path) -> Result<Child>;
}

/// Re-executes the current binary as `<exe> [global args] index <manifest>`
pub struct SelfLauncher {
    exe: PathBuf,
    global_args: Vec<OsString>,
}

impl SelfLauncher {
    pub fn new(exe: PathBuf, global_args: Vec<OsString>) -> Self {
        Self { exe, global_args }
    }

    pub fn current(global_args: Vec<OsString>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, global_args))
    }
}

impl IndexLauncher for SelfLauncher {
    fn launch(&self, manifest: &Path) -> Result<Child> {
        Command::new(&self.exe)
            .args(&self.global_args)
            .arg("index")
            .arg(manifest)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| StashError::ToolLaunch {
                tool: self.exe.display().to_string(),
                source,
            })
    }
}

/// Indexer subprocesses still running
#[derive(Default)]
pub struct ProcessPool {
    running: Vec<(Child, PathBuf)>,
}

impl ProcessPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn push(&mut self, child: Child, manifest: PathBuf) {
        self.running.push((child, manifest));
    }

    /// Collect finished children; returns how many finished. A failed
    /// indexer leaves its `.working` manifest behind for inspection.
    pub fn reap(&mut self) -> usize {
        let before = self.running.len();
        self.running.retain_mut(|(child, manifest)| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) if status.success() => {
                debug!(manifest = %manifest.display(), "indexer finished");
                false
            }
            Ok(Some(status)) => {
                error!(manifest = %manifest.display(), %status, "indexer failed");
                false
            }
            Err(e) => {
                error!(manifest = %manifest.display(), "lost track of indexer: {}", e);
                false
            }
        });
        before - self.running.len()
    }

    /// Block until every child has exited
    pub fn wait_all(&mut self) {
        for (mut child, manifest) in self.running.drain(..) {
            match child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => error!(manifest = %manifest.display(), %status, "indexer failed"),
                Err(e) => error!(manifest = %manifest.display(), "lost track of indexer: {}", e),
            }
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Launched(PathBuf),
    Idle,
}

pub struct Supervisor<L: IndexLauncher> {
    ingester: Ingester,
    launcher: L,
    processes: ProcessPool,
    manifest_dir: PathBuf,
    max_indexers: usize,
    poll_interval: Duration,
}

impl<L: IndexLauncher> Supervisor<L> {
    pub fn new(ingester: Ingester, launcher: L, config: &StashConfig) -> Self {
        Self {
            ingester,
            launcher,
            processes: ProcessPool::new(),
            manifest_dir: config.manifest_dir(),
            max_indexers: config.effective_max_indexers(),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    pub fn processes(&mut self) -> &mut ProcessPool {
        &mut self.processes
    }

    pub fn tick(&mut self) -> Result<Tick> {
        self.ingester.run_cycle()?;
        self.processes.reap();

        if self.processes.len() >= self.max_indexers {
            debug!(running = self.processes.len(), "indexer cap reached");
            return Ok(Tick::Idle);
        }

        for manifest in pending_manifests(&self.manifest_dir)? {
            // another supervisor may win the rename
            let Some(working) = claim(&manifest)? else {
                continue;
            };
            let child = match self.launcher.launch(&working) {
                Ok(child) => child,
                Err(e) => {
                    release(&working, &manifest);
                    return Err(e);
                }
            };
            info!(manifest = %working.display(), pid = child.id(), "indexer launched");
            self.processes.push(child, working.clone());
            return Ok(Tick::Launched(working));
        }

        Ok(Tick::Idle)
    }

    /// Tick until a run-fatal error
    pub fn run(&mut self) -> Result<()> {
        info!(
            manifest_dir = %self.manifest_dir.display(),
            max_indexers = self.max_indexers,
            "supervisor started"
        );
        loop {
            match self.tick() {
                Ok(Tick::Launched(_)) => {}
                Ok(Tick::Idle) => thread::sleep(self.poll_interval),
                Err(e) if e.is_run_fatal() => {
                    self.processes.wait_all();
                    return Err(e);
                }
                Err(e) => {
                    warn!("supervisor tick failed: {}", e);
                    thread::sleep(self.poll_interval);
                }
            }
        }
    }
}

/// Hand a claimed manifest back after its indexer failed to start
fn release(working: &Path, manifest: &Path) {
    match std::fs::rename(working, manifest) {
        Ok(()) => warn!(manifest = %manifest.display(), "indexer did not start, manifest released"),
        Err(e) => error!(
            manifest = %working.display(),
            "indexer did not start and the claim could not be released: {}", e
        ),
    }
}
