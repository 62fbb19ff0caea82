use super::lister::RemoteFs;
use super::{sync_remote_folder, RemoteFolder, SourceStats, SourceSyncer, SyncTarget};
use crate::config::{NfsConfig, Source};
use crate::error::SyncError;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens a session on an NFS export
pub trait NfsConnector: Send + Sync {
    fn connect(&self, config: &NfsConfig) -> io::Result<Box<dyn RemoteFs>>;
}

/// Syncs one NFS export folder
pub struct NfsSyncer {
    config: NfsConfig,
    connector: Arc<dyn NfsConnector>,
    label: String,
}

impl NfsSyncer {
    pub fn new(config: NfsConfig, connector: Arc<dyn NfsConnector>) -> Self {
        let label = Source::Nfs(config.clone()).label();
        Self {
            config,
            connector,
            label,
        }
    }
}

impl SourceSyncer for NfsSyncer {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn run(
        &mut self,
        cancel: &CancellationToken,
        target: &SyncTarget,
    ) -> Result<SourceStats, SyncError> {
        debug!("Connecting to {}", self.label);
        let mut fs = self
            .connector
            .connect(&self.config)
            .map_err(|e| SyncError::Connect {
                endpoint: self.label.clone(),
                reason: e.to_string(),
            })?;
        info!("Connected to {}", self.label);

        let folder = RemoteFolder {
            endpoint: &self.label,
            path: &self.config.folder,
            keep_folder_structure: self.config.keep_folder_structure,
            remove_after_download: self.config.remove_files_after_download,
        };
        let result = sync_remote_folder(fs.as_mut(), &folder, cancel, target);

        if let Err(e) = fs.disconnect() {
            warn!("Failed to disconnect from {}: {}", self.label, e);
        }

        result
    }
}
