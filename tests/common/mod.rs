//! Common test utilities and helpers for BookShift tests
#![allow(dead_code)]

use async_trait::async_trait;
use bookshift::config::{ImapConfig, NfsConfig, SmbConfig};
use bookshift::rescan::RescanOutcome;
use bookshift::kobo::DeviceLibrary;
use bookshift::source::imap::{ImapConnector, MailSession, MessageSummary, SearchCriteria};
use bookshift::source::lister::{RemoteEntry, RemoteFs};
use bookshift::source::{NfsConnector, SmbConnector, SmbSession};
use bookshift::RescanError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Temporary target folder plus config file location
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub target_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let target_dir = temp_dir.path().join("books");

        Self {
            temp_dir,
            target_dir,
        }
    }

    pub fn create_target(&self) {
        std::fs::create_dir_all(&self.target_dir).expect("Failed to create target dir");
    }

    pub fn write_target_file(&self, name: &str, content: &[u8]) {
        let path = self.target_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create target sub dir");
        }
        std::fs::write(path, content).expect("Failed to write target file");
    }

    pub fn read_target_file(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.target_dir.join(name)).expect("Failed to read target file")
    }

    /// Relative paths of every file under the target folder, sorted
    pub fn target_files(&self) -> Vec<String> {
        fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let relative = path.strip_prefix(root).unwrap();
                    out.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        let mut files = Vec::new();
        walk(&self.target_dir, &self.target_dir, &mut files);
        files.sort();
        files
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    pub fn create_minimal_config(&self) -> PathBuf {
        let config_content = format!(
            "target_folder: {}\nvalid_extensions: ['.epub']\nsources: []\n",
            self.target_dir.display()
        );
        self.create_test_config(&config_content)
    }
}

/// In-memory remote export shared between a test and its connectors
#[derive(Default)]
pub struct RemoteTree {
    pub files: BTreeMap<String, Vec<u8>>,
    pub folders: BTreeSet<String>,
    pub failing_reads: BTreeSet<String>,
    pub failing_removes: BTreeSet<String>,
    pub removed: Vec<String>,
    pub disconnects: usize,
    pub shares: Vec<String>,
}

pub type SharedTree = Arc<Mutex<RemoteTree>>;

pub fn remote_tree(files: &[(&str, &[u8])]) -> SharedTree {
    let mut tree = RemoteTree::default();
    for (path, content) in files {
        tree.files.insert(path.to_string(), content.to_vec());
    }
    Arc::new(Mutex::new(tree))
}

/// Reader that yields a few bytes, then fails
struct BrokenReader {
    sent: bool,
}

impl Read for BrokenReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.sent {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"));
        }
        self.sent = true;
        buf[0] = b'x';
        Ok(1)
    }
}

pub struct MemoryFs {
    tree: SharedTree,
}

impl RemoteFs for MemoryFs {
    fn list_dir(&mut self, path: &str) -> io::Result<Vec<RemoteEntry>> {
        let tree = self.tree.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));

        let mut entries = Vec::new();
        let mut seen_dirs = BTreeSet::new();
        let mut found = tree.folders.contains(path);

        for (key, content) in tree.files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            found = true;
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if seen_dirs.insert(dir.to_string()) {
                        entries.push(RemoteEntry::dir(dir));
                    }
                }
                None => entries.push(RemoteEntry::file(rest, content.len() as u64)),
            }
        }

        if found {
            Ok(entries)
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path)))
        }
    }

    fn open(&mut self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        let tree = self.tree.lock().unwrap();
        if tree.failing_reads.contains(path) {
            return Ok(Box::new(BrokenReader { sent: false }));
        }
        let content = tree
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.failing_removes.contains(path) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only export"));
        }
        tree.files
            .remove(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))?;
        tree.removed.push(path.to_string());
        Ok(())
    }

    fn disconnect(&mut self) -> io::Result<()> {
        self.tree.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

/// NFS connector serving a [`RemoteTree`], or refusing every connection
pub struct MemoryNfsConnector {
    pub tree: SharedTree,
    pub refuse: bool,
}

impl MemoryNfsConnector {
    pub fn new(tree: SharedTree) -> Arc<Self> {
        Arc::new(Self { tree, refuse: false })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            tree: remote_tree(&[]),
            refuse: true,
        })
    }
}

impl NfsConnector for MemoryNfsConnector {
    fn connect(&self, config: &NfsConfig) -> io::Result<Box<dyn RemoteFs>> {
        if self.refuse {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", config.host),
            ));
        }
        Ok(Box::new(MemoryFs {
            tree: self.tree.clone(),
        }))
    }
}

pub struct MemorySmbConnector {
    pub tree: SharedTree,
}

impl MemorySmbConnector {
    pub fn new(tree: SharedTree) -> Arc<Self> {
        Arc::new(Self { tree })
    }
}

struct MemorySmbSession {
    tree: SharedTree,
}

impl SmbSession for MemorySmbSession {
    fn tree_connect(&mut self, share: &str) -> io::Result<Box<dyn RemoteFs>> {
        self.tree.lock().unwrap().shares.push(share.to_string());
        Ok(Box::new(MemoryFs {
            tree: self.tree.clone(),
        }))
    }
}

impl SmbConnector for MemorySmbConnector {
    fn connect(&self, _config: &SmbConfig) -> io::Result<Box<dyn SmbSession>> {
        Ok(Box::new(MemorySmbSession {
            tree: self.tree.clone(),
        }))
    }
}

/// One message in a [`FakeMailbox`]
pub struct FakeMessage {
    pub summary: MessageSummary,
    pub parts: HashMap<Vec<u32>, Vec<u8>>,
}

#[derive(Default)]
pub struct FakeMailbox {
    pub messages: BTreeMap<u32, FakeMessage>,
    pub deleted: Vec<u32>,
    pub expunges: usize,
    pub fail_expunge: bool,
    pub logouts: usize,
    pub queries: Vec<String>,
}

pub type SharedMailbox = Arc<Mutex<FakeMailbox>>;

struct FakeMailSession {
    mailbox: SharedMailbox,
}

impl MailSession for FakeMailSession {
    fn search(&mut self, criteria: &SearchCriteria) -> io::Result<Vec<u32>> {
        let mut mailbox = self.mailbox.lock().unwrap();
        mailbox.queries.push(criteria.to_imap_query());
        Ok(mailbox
            .messages
            .keys()
            .copied()
            .filter(|uid| !mailbox.deleted.contains(uid))
            .collect())
    }

    fn fetch_summary(&mut self, uid: u32) -> io::Result<MessageSummary> {
        let mailbox = self.mailbox.lock().unwrap();
        mailbox
            .messages
            .get(&uid)
            .map(|m| m.summary.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such message"))
    }

    fn fetch_section(&mut self, uid: u32, path: &[u32]) -> io::Result<Vec<u8>> {
        let mailbox = self.mailbox.lock().unwrap();
        mailbox
            .messages
            .get(&uid)
            .and_then(|m| m.parts.get(path))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such part"))
    }

    fn mark_deleted(&mut self, uid: u32) -> io::Result<()> {
        self.mailbox.lock().unwrap().deleted.push(uid);
        Ok(())
    }

    fn expunge(&mut self) -> io::Result<()> {
        let mut mailbox = self.mailbox.lock().unwrap();
        if mailbox.fail_expunge {
            return Err(io::Error::new(io::ErrorKind::Other, "EXPUNGE rejected"));
        }
        mailbox.expunges += 1;
        let deleted = mailbox.deleted.clone();
        mailbox.messages.retain(|uid, _| !deleted.contains(uid));
        Ok(())
    }

    fn logout(&mut self) -> io::Result<()> {
        self.mailbox.lock().unwrap().logouts += 1;
        Ok(())
    }
}

pub struct FakeImapConnector {
    pub mailbox: SharedMailbox,
}

impl FakeImapConnector {
    pub fn new(mailbox: SharedMailbox) -> Arc<Self> {
        Arc::new(Self { mailbox })
    }
}

impl ImapConnector for FakeImapConnector {
    fn connect(&self, _config: &ImapConfig) -> io::Result<Box<dyn MailSession>> {
        Ok(Box::new(FakeMailSession {
            mailbox: self.mailbox.clone(),
        }))
    }
}

/// Device stand-in that counts library refresh requests
#[derive(Default)]
pub struct FakeDevice {
    pub is_kobo: bool,
    pub updates: AtomicUsize,
}

impl FakeDevice {
    pub fn kobo() -> Arc<Self> {
        Arc::new(Self {
            is_kobo: true,
            updates: AtomicUsize::new(0),
        })
    }

    pub fn desktop() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceLibrary for FakeDevice {
    fn is_target_device(&self) -> bool {
        self.is_kobo
    }

    async fn update_library(&self, _cancel: &CancellationToken) -> Result<RescanOutcome, RescanError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(RescanOutcome::Rescanned)
    }
}
