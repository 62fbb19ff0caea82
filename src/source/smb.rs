use super::lister::RemoteFs;
use super::{sync_remote_folder, RemoteFolder, SourceStats, SourceSyncer, SyncTarget};
use crate::config::{SmbConfig, Source};
use crate::error::SyncError;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens an authenticated session on an SMB server
pub trait SmbConnector: Send + Sync {
    fn connect(&self, config: &SmbConfig) -> io::Result<Box<dyn SmbSession>>;
}

/// An authenticated SMB session, before any share is attached
pub trait SmbSession: Send {
    /// Attach to `share`, returning its file tree
    fn tree_connect(&mut self, share: &str) -> io::Result<Box<dyn RemoteFs>>;

    fn logoff(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Syncs one folder of an SMB share
pub struct SmbSyncer {
    config: SmbConfig,
    connector: Arc<dyn SmbConnector>,
    label: String,
}

impl SmbSyncer {
    pub fn new(config: SmbConfig, connector: Arc<dyn SmbConnector>) -> Self {
        let label = Source::Smb(config.clone()).label();
        Self {
            config,
            connector,
            label,
        }
    }

    fn connect_error(&self, e: io::Error) -> SyncError {
        SyncError::Connect {
            endpoint: self.label.clone(),
            reason: e.to_string(),
        }
    }
}

impl SourceSyncer for SmbSyncer {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn run(
        &mut self,
        cancel: &CancellationToken,
        target: &SyncTarget,
    ) -> Result<SourceStats, SyncError> {
        debug!("Connecting to {}", self.label);
        let mut session = self
            .connector
            .connect(&self.config)
            .map_err(|e| self.connect_error(e))?;

        let result = match session.tree_connect(&self.config.share) {
            Ok(mut share) => {
                info!("Connected to {}", self.label);
                let folder = RemoteFolder {
                    endpoint: &self.label,
                    path: &self.config.folder,
                    keep_folder_structure: self.config.keep_folder_structure,
                    remove_after_download: self.config.remove_files_after_download,
                };
                let result = sync_remote_folder(share.as_mut(), &folder, cancel, target);

                if let Err(e) = share.disconnect() {
                    warn!("Failed to disconnect share on {}: {}", self.label, e);
                }
                result
            }
            Err(e) => Err(self.connect_error(e)),
        };

        if let Err(e) = session.logoff() {
            warn!("Failed to log off from {}: {}", self.label, e);
        }

        result
    }
}
