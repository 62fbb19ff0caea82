//! Production NFS and SMB access through the kernel's network filesystem
//! clients. The export or share is mounted on a private temporary directory
//! for the lifetime of one sync and unmounted on disconnect.

use super::lister::{RemoteEntry, RemoteFs};
use super::nfs::NfsConnector;
use super::smb::{SmbConnector, SmbSession};
use crate::config::{NfsConfig, SmbConfig};
use std::fs;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fail fast when the host does not accept TCP connections on `port`
pub fn probe_tcp(host: &str, port: u16) -> io::Result<()> {
    let addrs = (host, port).to_socket_addrs()?;
    let mut last_error = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("{} did not resolve to any address", host),
    );

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, PROBE_TIMEOUT) {
            Ok(_) => return Ok(()),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}

fn run_command(program: &str, args: &[&str]) -> io::Result<()> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} failed: {}", program, stderr.trim()),
        ));
    }

    Ok(())
}

/// A mounted export or share, exposed as a [`RemoteFs`]
///
/// The mount point is a plain path, never a self-deleting temporary
/// directory: while the share is attached, recursive cleanup would delete
/// the remote files.
pub struct MountedFs {
    mount_point: Option<PathBuf>,
}

impl MountedFs {
    /// Mount `device` with `mount -t <fs_type>` on a fresh temporary directory
    pub fn mount(fs_type: &str, device: &str, options: &str) -> io::Result<Self> {
        let mount_point = tempfile::Builder::new()
            .prefix("bookshift-mnt-")
            .tempdir()?
            .keep();
        let target = mount_point.to_string_lossy().into_owned();

        if let Err(e) = run_command("mount", &["-t", fs_type, "-o", options, device, &target]) {
            if let Err(cleanup) = fs::remove_dir(&mount_point) {
                warn!("Failed to remove mount point {}: {}", target, cleanup);
            }
            return Err(e);
        }

        Ok(Self {
            mount_point: Some(mount_point),
        })
    }

    fn root(&self) -> io::Result<&Path> {
        self.mount_point
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "share is not mounted"))
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut resolved = self.root()?.to_path_buf();
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if part == ".." {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes the share: {}", path),
                ));
            }
            resolved.push(part);
        }
        Ok(resolved)
    }

    /// Detach the share, then remove the now empty mount point
    ///
    /// A failed umount keeps the mount point untouched.
    fn unmount(&mut self) -> io::Result<()> {
        let Some(mount_point) = self.mount_point.clone() else {
            return Ok(());
        };

        let target = mount_point.to_string_lossy().into_owned();
        run_command("umount", &[&target])?;
        self.mount_point = None;

        // Non-recursive: leftovers mean something is still attached
        fs::remove_dir(&mount_point)
    }
}

impl RemoteFs for MountedFs {
    fn list_dir(&mut self, path: &str) -> io::Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let metadata = entry.path().symlink_metadata()?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                is_link: metadata.file_type().is_symlink(),
                size: metadata.len(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn open(&mut self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(self.resolve(path)?)?))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path)?)
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.unmount()
    }
}

impl Drop for MountedFs {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            warn!("Failed to unmount share: {}", e);
        }
    }
}

/// Mounts NFS exports with `mount -t nfs4`
#[derive(Debug, Default, Clone, Copy)]
pub struct MountNfsConnector;

impl NfsConnector for MountNfsConnector {
    fn connect(&self, config: &NfsConfig) -> io::Result<Box<dyn RemoteFs>> {
        probe_tcp(&config.host, config.port())?;

        let device = format!("{}:/", config.host);
        let options = format!("port={}", config.port());
        Ok(Box::new(MountedFs::mount("nfs4", &device, &options)?))
    }
}

/// Mounts SMB shares with `mount -t cifs`
#[derive(Debug, Default, Clone, Copy)]
pub struct CifsConnector;

impl SmbConnector for CifsConnector {
    fn connect(&self, config: &SmbConfig) -> io::Result<Box<dyn SmbSession>> {
        probe_tcp(&config.host, config.port())?;

        Ok(Box::new(CifsSession {
            config: config.clone(),
        }))
    }
}

/// Credentials are handed to mount.cifs through a 0600 file, never argv
struct CifsSession {
    config: SmbConfig,
}

impl CifsSession {
    fn credentials_file(&self) -> io::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("bookshift-cred-")
            .tempfile()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        if self.config.username.is_empty() {
            writeln!(file, "username=guest")?;
        } else {
            writeln!(file, "username={}", self.config.username)?;
            writeln!(file, "password={}", self.config.password.expose())?;
        }
        if !self.config.domain.is_empty() {
            writeln!(file, "domain={}", self.config.domain)?;
        }
        file.as_file().sync_all()?;

        Ok(file)
    }
}

impl SmbSession for CifsSession {
    fn tree_connect(&mut self, share: &str) -> io::Result<Box<dyn RemoteFs>> {
        let credentials = self.credentials_file()?;
        let device = format!("//{}/{}", self.config.host, share.trim_matches('/'));
        let options = format!(
            "port={},credentials={}",
            self.config.port(),
            credentials.path().display()
        );

        let mounted = MountedFs::mount("cifs", &device, &options)?;
        Ok(Box::new(mounted))
    }
}
