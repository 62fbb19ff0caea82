//! Sync Engine - Orchestrates concurrent source synchronization
//!
//! One run counts the books already in the target folder, syncs every
//! configured source with bounded concurrency, counts again and asks the
//! e-reader to refresh its library when new books arrived. A failing source
//! is logged and reported without affecting its siblings; only the two
//! counts and the library refresh can fail the run as a whole.

use crate::config::{Config, DEFAULT_CONCURRENCY};
use crate::counter::{FileCounter, FolderCounter};
use crate::download::{AtomicFileWriter, ExtensionFilter, RunOptions};
use crate::error::SyncError;
use crate::kobo::{DeviceLibrary, KoboDevice};
use crate::rescan::RescanOutcome;
use crate::source::{
    check_cancelled, DefaultSyncerFactory, SourceStats, SourceSyncer, SyncTarget, SyncerFactory,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one source within a run
#[derive(Debug)]
pub struct SourceReport {
    pub label: String,
    pub result: Result<SourceStats, SyncError>,
}

/// Results from a complete sync run
#[derive(Debug)]
pub struct SyncSummary {
    pub files_before: usize,
    pub files_after: usize,
    pub sources: Vec<SourceReport>,
    /// Set when the library refresh ran
    pub rescan: Option<RescanOutcome>,
    /// The run was interrupted before every source finished
    pub cancelled: bool,
    pub duration: Duration,
}

impl SyncSummary {
    /// New books in the target folder
    pub fn books_added(&self) -> usize {
        self.files_after.saturating_sub(self.files_before)
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|r| r.result.is_err()).count()
    }

    pub fn files_downloaded(&self) -> usize {
        self.sources
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(|stats| stats.downloaded)
            .sum()
    }
}

/// Concurrency actually used: the configured value (or the default when
/// unset or zero), never more than the number of sources and never below one
pub fn effective_concurrency(configured: Option<usize>, sources: usize) -> usize {
    configured
        .filter(|c| *c > 0)
        .unwrap_or(DEFAULT_CONCURRENCY)
        .clamp(1, sources.max(1))
}

/// The main sync engine that orchestrates source synchronization
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<Config>,
    options: RunOptions,
    syncers: Arc<dyn SyncerFactory>,
    counter: Arc<dyn FileCounter>,
    device: Arc<dyn DeviceLibrary>,
}

impl SyncEngine {
    /// Create a sync engine wired to the production protocol clients and device
    pub fn new(config: Config, options: RunOptions) -> Self {
        let device = Arc::new(KoboDevice::from_config(&config.kobo));

        Self {
            config: Arc::new(config),
            options,
            syncers: Arc::new(DefaultSyncerFactory::default()),
            counter: Arc::new(FolderCounter),
            device,
        }
    }

    pub fn with_syncers(mut self, syncers: Arc<dyn SyncerFactory>) -> Self {
        self.syncers = syncers;
        self
    }

    pub fn with_counter(mut self, counter: Arc<dyn FileCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceLibrary>) -> Self {
        self.device = device;
        self
    }

    /// Get configuration for external inspection
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn target(&self) -> SyncTarget {
        SyncTarget {
            folder: self.config.target_folder(),
            extensions: ExtensionFilter::new(&self.config.valid_extensions),
            overwrite: self.config.overwrite_existing_files,
            writer: AtomicFileWriter::new(self.options),
        }
    }

    /// Run a complete sync pass over every configured source
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncSummary, SyncError> {
        let start_time = Instant::now();
        let target = Arc::new(self.target());

        let files_before = self.count_files(&target).await?;
        info!(
            "Starting sync of {} sources into {} ({} books present)",
            self.config.sources.len(),
            target.folder.display(),
            files_before
        );

        let sources = self.sync_sources(&target, cancel).await;

        let files_after = self.count_files(&target).await?;
        let added = files_after.saturating_sub(files_before);
        info!("{} new books downloaded", added);

        let cancelled = cancel.is_cancelled();
        let mut rescan = None;

        if files_after > files_before {
            if cancelled {
                warn!("Sync was interrupted, skipping library rescan");
            } else if self.device.is_target_device() {
                info!("Updating device library");
                rescan = Some(self.device.update_library(cancel).await?);
            } else {
                debug!("Not running on a Kobo device, skipping library rescan");
            }
        }

        let summary = SyncSummary {
            files_before,
            files_after,
            sources,
            rescan,
            cancelled,
            duration: start_time.elapsed(),
        };

        info!(
            "Sync completed in {:.2}s: {} sources, {} failed, {} new books",
            summary.duration.as_secs_f64(),
            summary.sources.len(),
            summary.failed_sources(),
            summary.books_added()
        );

        Ok(summary)
    }

    async fn count_files(&self, target: &SyncTarget) -> Result<usize, SyncError> {
        let counter = self.counter.clone();
        let folder = target.folder.clone();
        let filter = target.extensions.clone();

        tokio::task::spawn_blocking(move || counter.count(&folder, &filter))
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }

    /// Sync all sources with bounded concurrency; waits for every worker
    async fn sync_sources(
        &self,
        target: &Arc<SyncTarget>,
        cancel: &CancellationToken,
    ) -> Vec<SourceReport> {
        let concurrency = effective_concurrency(self.config.concurrency, self.config.sources.len());
        debug!("Syncing with concurrency {}", concurrency);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut futures = FuturesUnordered::new();

        for source in &self.config.sources {
            let semaphore = semaphore.clone();
            let syncer = self.syncers.syncer_for(source);
            let target = target.clone();
            let limit = source.timeout();
            let cancel = cancel.child_token();

            futures.push(async move {
                let label = syncer.label();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_source(syncer, target, limit, cancel).await,
                    Err(e) => Err(SyncError::Task(e.to_string())),
                };
                SourceReport { label, result }
            });
        }

        let mut reports = Vec::new();

        while let Some(report) = futures.next().await {
            match &report.result {
                Ok(stats) => info!(
                    "{}: {} downloaded, {} skipped, {} deleted",
                    report.label, stats.downloaded, stats.skipped, stats.deleted
                ),
                Err(e) => error!("{}: {}", report.label, e),
            }
            reports.push(report);
        }

        reports
    }
}

/// Run one syncer on the blocking pool, bounded by its optional timeout
///
/// On timeout the source's token is cancelled and the worker is awaited
/// until it reaches its next cancellation check.
async fn run_source(
    mut syncer: Box<dyn SourceSyncer>,
    target: Arc<SyncTarget>,
    limit: Option<Duration>,
    cancel: CancellationToken,
) -> Result<SourceStats, SyncError> {
    check_cancelled(&cancel)?;

    let worker_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || syncer.run(&worker_cancel, &target));

    let joined = match limit {
        None => (&mut handle).await,
        Some(limit) => {
            let waited = timeout(limit, &mut handle).await;
            match waited {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Source timed out after {}s, cancelling", limit.as_secs());
                    cancel.cancel();
                    if let Err(e) = handle.await {
                        warn!("Source worker failed after timeout: {}", e);
                    }
                    return Err(SyncError::TimedOut(limit));
                }
            }
        }
    };

    joined.map_err(|e| SyncError::Task(e.to_string()))?
}
