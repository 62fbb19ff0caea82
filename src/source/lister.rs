//! Recursive listing of a remote folder through the [`RemoteFs`] capability

use crate::download::ExtensionFilter;
use crate::error::SyncError;
use std::io::{self, Read};
use tracing::{debug, warn};

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub is_link: bool,
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            is_dir: false,
            is_link: false,
            size,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            is_link: false,
            size: 0,
        }
    }
}

/// File operations a connected NFS export or SMB share offers
///
/// Paths are `/`-separated and relative to the root of the export or share.
pub trait RemoteFs: Send {
    fn list_dir(&mut self, path: &str) -> io::Result<Vec<RemoteEntry>>;

    fn open(&mut self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    fn remove(&mut self, path: &str) -> io::Result<()>;

    fn disconnect(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A remote file selected for download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileDescriptor {
    /// Full remote path, used to open and delete the file
    pub remote_path: String,
    pub name: String,
    pub size: u64,
    /// Folder relative to the listing root, empty for files in the root
    pub sub_folder: String,
}

/// How a listing treats the tree below the requested root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListPolicy {
    pub recurse: bool,
    /// Log and skip sub-directories that cannot be listed instead of failing
    pub continue_on_subtree_error: bool,
}

impl Default for ListPolicy {
    fn default() -> Self {
        Self {
            recurse: true,
            continue_on_subtree_error: true,
        }
    }
}

/// Depth-first walk that yields matching files in listing order
pub struct RemoteFileLister<'a> {
    endpoint: &'a str,
    filter: &'a ExtensionFilter,
    policy: ListPolicy,
}

impl<'a> RemoteFileLister<'a> {
    pub fn new(endpoint: &'a str, filter: &'a ExtensionFilter, policy: ListPolicy) -> Self {
        Self {
            endpoint,
            filter,
            policy,
        }
    }

    /// List `root`. A failure on the root itself is always fatal.
    pub fn list(
        &self,
        fs: &mut dyn RemoteFs,
        root: &str,
    ) -> Result<Vec<RemoteFileDescriptor>, SyncError> {
        let root = normalize_remote_path(root);
        let mut files = Vec::new();
        self.walk(fs, &root, "", &mut files)?;
        debug!("Found {} matching files under {} on {}", files.len(), root, self.endpoint);
        Ok(files)
    }

    fn walk(
        &self,
        fs: &mut dyn RemoteFs,
        path: &str,
        sub_folder: &str,
        files: &mut Vec<RemoteFileDescriptor>,
    ) -> Result<(), SyncError> {
        let entries = fs.list_dir(path).map_err(|e| SyncError::List {
            endpoint: self.endpoint.to_string(),
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        for entry in entries {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if entry.is_link {
                debug!("Skipping link {}/{}", path, entry.name);
                continue;
            }

            let child_path = join_remote(path, &entry.name);

            if entry.is_dir {
                if !self.policy.recurse {
                    continue;
                }

                let child_sub = join_remote(sub_folder, &entry.name);
                if let Err(e) = self.walk(fs, &child_path, &child_sub, files) {
                    if !self.policy.continue_on_subtree_error {
                        return Err(e);
                    }
                    warn!("Skipping {} on {}: {}", child_path, self.endpoint, e);
                }
            } else if self.filter.matches(&entry.name) {
                files.push(RemoteFileDescriptor {
                    remote_path: child_path,
                    name: entry.name,
                    size: entry.size,
                    sub_folder: sub_folder.trim_start_matches('/').to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Trim redundant separators; the export root is `/`
pub fn normalize_remote_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

fn join_remote(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}
