//! Kobo device detection, library refresh and uninstall

use crate::config::KoboConfig;
use crate::error::RescanError;
use crate::nickel_dbus::{NickelDbus, NickelHardwareStatus};
use crate::rescan::{LibraryRescanTrigger, RescanKind, RescanOutcome};
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Present on every Kobo firmware
pub const KOBO_MARKER: &str = "/usr/local/Kobo";

/// Files and folders put in place by the installer
pub const INSTALLED_ARTIFACTS: &[&str] = &[
    "/mnt/onboard/.adds/nm/bookshift",
    "/etc/udev/rules.d/97-bookshift.rules",
    "/usr/local/bookshift",
];

/// The e-reader whose library is refreshed after new books arrive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceLibrary: Send + Sync {
    /// Whether this host is the e-reader
    fn is_target_device(&self) -> bool;

    async fn update_library(&self, cancel: &CancellationToken) -> Result<RescanOutcome, RescanError>;
}

/// A Kobo e-reader running Nickel
#[derive(Debug, Clone)]
pub struct KoboDevice {
    marker: PathBuf,
    config: KoboConfig,
}

impl KoboDevice {
    pub fn from_config(config: &KoboConfig) -> Self {
        Self {
            marker: PathBuf::from(KOBO_MARKER),
            config: config.clone(),
        }
    }

    /// Detect the device through a different marker path
    pub fn with_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.marker = marker.into();
        self
    }

    fn rescan_kind(&self) -> RescanKind {
        if self.config.full_rescan {
            RescanKind::Full
        } else {
            RescanKind::Partial
        }
    }
}

#[async_trait]
impl DeviceLibrary for KoboDevice {
    fn is_target_device(&self) -> bool {
        self.marker.exists()
    }

    async fn update_library(&self, cancel: &CancellationToken) -> Result<RescanOutcome, RescanError> {
        let mut trigger = LibraryRescanTrigger::new(
            NickelDbus::new(),
            NickelHardwareStatus::default(),
            self.rescan_kind(),
            self.config.hotplug_pause(),
        );

        trigger
            .run(self.config.rescan_timeout(), cancel)
            .await
    }
}

/// Removes what the installer put on the device
#[derive(Debug, Clone)]
pub struct Uninstaller {
    paths: Vec<PathBuf>,
}

impl Default for Uninstaller {
    fn default() -> Self {
        Self::new(INSTALLED_ARTIFACTS.iter().map(PathBuf::from))
    }
}

impl Uninstaller {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    /// Remove every artifact, returning the ones that existed
    pub fn run(&self, dry_run: bool) -> io::Result<Vec<PathBuf>> {
        let mut removed = Vec::new();

        for path in &self.paths {
            if dry_run {
                if path.symlink_metadata().is_ok() {
                    info!("[dry-run] Would remove {}", path.display());
                    removed.push(path.clone());
                }
                continue;
            }

            if remove_path(path)? {
                info!("Removed {}", path.display());
                removed.push(path.clone());
            } else {
                debug!("{} not present", path.display());
            }
        }

        Ok(removed)
    }
}

fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match path.symlink_metadata() {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
