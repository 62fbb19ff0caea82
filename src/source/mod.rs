//! Per-protocol source syncers and the contract the orchestrator drives
//!
//! A syncer is a blocking unit of work: connect, enumerate candidates,
//! download each one through the [`AtomicFileWriter`], optionally delete the
//! remote original and disconnect. The orchestrator runs each syncer on the
//! blocking thread pool and observes it only through [`SourceSyncer`].

pub mod imap;
pub mod lister;
pub mod mount;
pub mod nfs;
pub mod smb;

use crate::config::Source;
use crate::download::{sanitize_file_name, AtomicFileWriter, DownloadOutcome, ExtensionFilter};
use crate::error::SyncError;
use lister::{ListPolicy, RemoteFileLister, RemoteFs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use imap::{ImapConnector, ImapSyncer, TlsImapConnector};
pub use lister::{RemoteEntry, RemoteFileDescriptor};
pub use mount::{CifsConnector, MountNfsConnector};
pub use nfs::{NfsConnector, NfsSyncer};
pub use smb::{SmbConnector, SmbSession, SmbSyncer};

/// Where and how a syncer stores what it downloads
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub folder: PathBuf,
    pub extensions: ExtensionFilter,
    pub overwrite: bool,
    pub writer: AtomicFileWriter,
}

/// Per-source counters reported back to the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub downloaded: usize,
    pub skipped: usize,
    pub deleted: usize,
    /// Downloads a dry run would have performed
    pub planned: usize,
}

impl SourceStats {
    pub(crate) fn record(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Written { .. } => self.downloaded += 1,
            DownloadOutcome::Skipped(_) => self.skipped += 1,
            DownloadOutcome::DryRun(_) => self.planned += 1,
        }
    }
}

/// One protocol-specific sync of a single source
pub trait SourceSyncer: Send {
    /// Identity used in logs and the run summary
    fn label(&self) -> String;

    /// Sync everything the source offers into `target`
    ///
    /// `cancel` is checked before each download. Disconnect happens whether
    /// or not the sync succeeded.
    fn run(
        &mut self,
        cancel: &CancellationToken,
        target: &SyncTarget,
    ) -> Result<SourceStats, SyncError>;
}

/// Builds the syncer that matches a configured source
pub trait SyncerFactory: Send + Sync {
    fn syncer_for(&self, source: &Source) -> Box<dyn SourceSyncer>;
}

/// Factory wired to the connectors used in production
#[derive(Clone)]
pub struct DefaultSyncerFactory {
    nfs: Arc<dyn NfsConnector>,
    smb: Arc<dyn SmbConnector>,
    imap: Arc<dyn ImapConnector>,
}

impl DefaultSyncerFactory {
    pub fn new(
        nfs: Arc<dyn NfsConnector>,
        smb: Arc<dyn SmbConnector>,
        imap: Arc<dyn ImapConnector>,
    ) -> Self {
        Self { nfs, smb, imap }
    }
}

impl Default for DefaultSyncerFactory {
    fn default() -> Self {
        Self::new(
            Arc::new(MountNfsConnector),
            Arc::new(CifsConnector),
            Arc::new(TlsImapConnector::default()),
        )
    }
}

impl SyncerFactory for DefaultSyncerFactory {
    fn syncer_for(&self, source: &Source) -> Box<dyn SourceSyncer> {
        match source {
            Source::Nfs(config) => Box::new(NfsSyncer::new(config.clone(), self.nfs.clone())),
            Source::Smb(config) => Box::new(SmbSyncer::new(config.clone(), self.smb.clone())),
            Source::Imap(config) => Box::new(ImapSyncer::new(config.clone(), self.imap.clone())),
        }
    }
}

/// Stop at a loop boundary once the run or the source has been cancelled
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<(), SyncError> {
    if cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

/// Remote folder settings shared by NFS and SMB
#[derive(Debug, Clone)]
pub(crate) struct RemoteFolder<'a> {
    pub endpoint: &'a str,
    pub path: &'a str,
    pub keep_folder_structure: bool,
    pub remove_after_download: bool,
}

/// List a mounted folder and download every matching file, one at a time
pub(crate) fn sync_remote_folder(
    fs: &mut dyn RemoteFs,
    folder: &RemoteFolder<'_>,
    cancel: &CancellationToken,
    target: &SyncTarget,
) -> Result<SourceStats, SyncError> {
    let lister = RemoteFileLister::new(folder.endpoint, &target.extensions, ListPolicy::default());
    let files = lister.list(fs, folder.path)?;
    info!("{}: {} matching files", folder.endpoint, files.len());

    let mut stats = SourceStats::default();

    for file in files {
        check_cancelled(cancel)?;

        let dest_folder = if folder.keep_folder_structure {
            local_sub_folder(&target.folder, &file.sub_folder)
        } else {
            target.folder.clone()
        };
        let dest_name = sanitize_file_name(&file.name);

        let outcome = target.writer.download(
            &dest_folder,
            &dest_name,
            target.overwrite,
            file.size,
            || fs.open(&file.remote_path),
        )?;
        stats.record(&outcome);

        if !folder.remove_after_download {
            continue;
        }

        match outcome {
            DownloadOutcome::Written { .. } => {
                fs.remove(&file.remote_path).map_err(|e| SyncError::Delete {
                    endpoint: folder.endpoint.to_string(),
                    item: file.remote_path.clone(),
                    reason: e.to_string(),
                })?;
                info!("Deleted {} from {}", file.remote_path, folder.endpoint);
                stats.deleted += 1;
            }
            DownloadOutcome::DryRun(_) => {
                info!(
                    "[dry-run] Would delete {} from {}",
                    file.remote_path, folder.endpoint
                );
            }
            DownloadOutcome::Skipped(_) => {}
        }
    }

    Ok(stats)
}

/// Recreate a remote sub-folder under the target, one component at a time
fn local_sub_folder(target: &Path, sub_folder: &str) -> PathBuf {
    sub_folder
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .fold(target.to_path_buf(), |path, part| path.join(part))
}
