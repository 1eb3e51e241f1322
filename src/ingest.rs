/*!
 * Ingestion worker pool
 *
 * A scan lists both staging directories and feeds one work item per staged
 * blob into a bounded queue. A fixed set of workers, each holding its own
 * catalog connection, drain it through the blob store. Every cycle ends with
 * a countable completion barrier: one shutdown message per worker, one
 * report back from each, before the next scan may begin.
 */

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::catalog::Catalog;
use crate::config::StashConfig;
use crate::error::{Result, StashError};
use crate::store::{BlobStore, ExternalShardAppender, IngestOutcome};
use crate::tools::ToolCommand;

/// One staged blob awaiting ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub text: bool,
    pub hex: String,
}

enum Message {
    Work(WorkItem),
    Shutdown,
}

/// Opens one catalog connection per worker
pub type CatalogFactory = Arc<dyn Fn() -> Result<Catalog> + Send + Sync>;

/// What a single worker did before it shut down
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub stored: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Set when the worker stopped early on a run-fatal error
    pub fatal: Option<StashError>,
}

/// Totals for one scan-and-drain cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub queued: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl CycleStats {
    fn absorb(&mut self, report: &WorkerReport) {
        self.stored += report.stored;
        self.duplicates += report.duplicates;
        self.skipped += report.skipped;
        self.failed += report.failed;
    }
}

fn worker_loop(store: BlobStore, factory: CatalogFactory, work: Receiver<Message>) -> WorkerReport {
    let mut report = WorkerReport::default();

    let mut catalog = match factory() {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("worker could not open the catalog: {}", e);
            report.fatal = Some(e);
            return report;
        }
    };

    while let Ok(Message::Work(item)) = work.recv() {
        match store.ingest(&mut catalog, item.text, &item.hex) {
            Ok(IngestOutcome::Stored { .. }) => report.stored += 1,
            Ok(IngestOutcome::Duplicate) => report.duplicates += 1,
            Ok(IngestOutcome::Skipped) => report.skipped += 1,
            Ok(IngestOutcome::Unstored) => report.failed += 1,
            Err(e) if e.is_run_fatal() => {
                error!(hash = %item.hex, "worker stopping: {}", e);
                report.fatal = Some(e);
                break;
            }
            Err(e) => {
                error!(hash = %item.hex, "ingest failed: {}", e);
                report.failed += 1;
            }
        }
    }

    report
}

/// A running set of workers for one cycle
pub struct WorkPool {
    work_tx: Sender<Message>,
    done_rx: Receiver<WorkerReport>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkPool {
    pub fn start(
        workers: usize,
        queue_capacity: usize,
        store: &BlobStore,
        factory: &CatalogFactory,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let (work_tx, work_rx) = bounded::<Message>(queue_capacity);
        let (done_tx, done_rx) = bounded::<WorkerReport>(workers);

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let store = store.clone();
            let factory = Arc::clone(factory);
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ingest-{}", i))
                .spawn(move || {
                    let report = worker_loop(store, factory, work_rx);
                    let _ = done_tx.send(report);
                })?;
            handles.push(handle);
        }

        Ok(Self {
            work_tx,
            done_rx,
            handles,
        })
    }

    /// Queue one item, blocking while the queue is full
    pub fn submit(&self, item: WorkItem) -> Result<()> {
        self.work_tx
            .send(Message::Work(item))
            .map_err(|_| StashError::Parallel("all ingestion workers have exited".to_string()))
    }

    /// Completion barrier: shut every worker down and collect its report.
    /// The first run-fatal error any worker hit is returned.
    pub fn stop(self) -> Result<CycleStats> {
        let workers = self.handles.len();
        for _ in 0..workers {
            // a disconnected queue means every worker already exited
            if self.work_tx.send(Message::Shutdown).is_err() {
                break;
            }
        }

        let mut stats = CycleStats::default();
        let mut fatal = None;
        let mut reports = 0;
        while reports < workers {
            match self.done_rx.recv() {
                Ok(report) => {
                    stats.absorb(&report);
                    if fatal.is_none() {
                        fatal = report.fatal;
                    }
                    reports += 1;
                }
                Err(_) => break,
            }
        }

        for handle in self.handles {
            let _ = handle.join();
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if reports < workers {
            return Err(StashError::Parallel(format!(
                "{} of {} ingestion workers exited without reporting",
                workers - reports,
                workers
            )));
        }
        Ok(stats)
    }
}

/// List both staging directories, handing each blob name to `submit`.
/// Hidden names (temporary files) are ignored.
pub fn scan_staging<F>(root: &Path, mut submit: F) -> Result<u64>
where
    F: FnMut(WorkItem) -> Result<()>,
{
    let mut queued = 0;
    for (text, sub) in [(true, "text"), (false, "bin")] {
        let dir = root.join(sub);
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir.display(), "failed to list staging entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            submit(WorkItem {
                text,
                hex: name.to_string(),
            })?;
            queued += 1;
        }
    }
    Ok(queued)
}

/// Drives scan-and-drain cycles over one staging root
pub struct Ingester {
    store: BlobStore,
    factory: CatalogFactory,
    workers: usize,
    queue_capacity: usize,
}

impl Ingester {
    pub fn new(store: BlobStore, factory: CatalogFactory, workers: usize, queue_capacity: usize) -> Self {
        Self {
            store,
            factory,
            workers,
            queue_capacity,
        }
    }

    /// Production wiring: `catfight` appender and one SQLite connection per
    /// worker
    pub fn from_config(config: &StashConfig) -> Result<Self> {
        let tool = ToolCommand::from_argv(&config.shard_append_command)?;
        let appender = Arc::new(ExternalShardAppender::new(tool, config.shard_dir()));
        let store = BlobStore::new(config.root.clone(), appender);

        let catalog_config = config.clone();
        let factory: CatalogFactory = Arc::new(move || Catalog::from_config(&catalog_config));

        Ok(Self::new(
            store,
            factory,
            config.effective_workers(),
            config.queue_capacity,
        ))
    }

    /// One full scan, drained to completion
    pub fn run_cycle(&self) -> Result<CycleStats> {
        let pool = WorkPool::start(self.workers, self.queue_capacity, &self.store, &self.factory)?;
        let scanned = scan_staging(self.store.root(), |item| pool.submit(item));

        // The barrier runs even when the scan stopped early so no worker is
        // left behind; a worker's own fatal error wins over the send failure
        let mut stats = pool.stop()?;
        stats.queued = scanned?;

        if stats.queued > 0 {
            info!(
                queued = stats.queued,
                stored = stats.stored,
                duplicates = stats.duplicates,
                skipped = stats.skipped,
                failed = stats.failed,
                "ingestion cycle complete"
            );
        } else {
            debug!("nothing staged");
        }
        Ok(stats)
    }

    /// Cycle until a run-fatal error, sleeping between idle scans
    pub fn run_forever(&self, poll_interval: Duration) -> Result<()> {
        loop {
            let stats = self.run_cycle()?;
            if stats.queued == 0 {
                thread::sleep(poll_interval);
            }
        }
    }
}
