use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Concurrency used when the configuration leaves it unset or at zero
pub const DEFAULT_CONCURRENCY: usize = 3;

pub const DEFAULT_NFS_PORT: u16 = 2049;
pub const DEFAULT_SMB_PORT: u16 = 445;
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Main configuration structure for BookShift
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Local folder the e-books are downloaded into
    #[serde(default)]
    pub target_folder: String,

    /// File extensions to download, matched case-insensitively
    #[serde(default)]
    pub valid_extensions: Vec<String>,

    /// Replace local files that already exist
    #[serde(default)]
    pub overwrite_existing_files: bool,

    /// Maximum number of sources synced at the same time
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Kobo library refresh settings
    #[serde(default)]
    pub kobo: KoboConfig,

    /// Remote sources, processed concurrently
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// Kobo library refresh settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KoboConfig {
    /// How long to wait for NickelDbus to report the rescan as done
    #[serde(default = "default_rescan_timeout")]
    pub rescan_timeout_seconds: u64,

    /// Request a full rescan instead of a partial one
    #[serde(default = "default_true")]
    pub full_rescan: bool,

    /// Pause between the simulated USB plug and unplug events
    #[serde(default = "default_hotplug_pause")]
    pub hotplug_pause_seconds: u64,
}

/// A configured remote endpoint. The `type` tag selects the config shape.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum Source {
    Nfs(NfsConfig),
    Smb(SmbConfig),
    Imap(ImapConfig),
}

/// NFS export settings
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NfsConfig {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub folder: String,
    #[serde(default, rename = "keep_folderstructure", alias = "keep_folder_structure")]
    pub keep_folder_structure: bool,
    #[serde(default)]
    pub remove_files_after_download: bool,
    pub timeout_seconds: Option<u64>,
}

/// SMB share settings
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SmbConfig {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Password,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub share: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default, rename = "keep_folderstructure", alias = "keep_folder_structure")]
    pub keep_folder_structure: bool,
    #[serde(default)]
    pub remove_files_after_download: bool,
    pub timeout_seconds: Option<u64>,
}

/// IMAP mailbox settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImapConfig {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Password,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,

    /// Header used to select messages
    pub filter_field: Option<FilterField>,
    #[serde(default)]
    pub filter_value: String,

    /// Also process messages that are already marked `\Seen`
    #[serde(default)]
    pub process_read_emails: bool,
    #[serde(default)]
    pub remove_emails_after_download: bool,
    pub timeout_seconds: Option<u64>,
}

/// Message header an IMAP search filters on
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterField {
    To,
    Subject,
}

/// A secret string that never shows up in logs or debug output
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_rescan_timeout() -> u64 {
    30
}
fn default_hotplug_pause() -> u64 {
    10
}
fn default_mailbox() -> String {
    "INBOX".to_string()
}

impl KoboConfig {
    /// How long to wait for the rescan completion signal
    pub fn rescan_timeout(&self) -> Duration {
        Duration::from_secs(self.rescan_timeout_seconds)
    }

    pub fn hotplug_pause(&self) -> Duration {
        Duration::from_secs(self.hotplug_pause_seconds)
    }
}

impl Default for KoboConfig {
    fn default() -> Self {
        Self {
            rescan_timeout_seconds: default_rescan_timeout(),
            full_rescan: default_true(),
            hotplug_pause_seconds: default_hotplug_pause(),
        }
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            username: String::new(),
            password: Password::default(),
            mailbox: default_mailbox(),
            filter_field: None,
            filter_value: String::new(),
            process_read_emails: false,
            remove_emails_after_download: false,
            timeout_seconds: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            target_folder: String::new(),
            valid_extensions: Vec::new(),
            overwrite_existing_files: false,
            concurrency: None,
            kobo: KoboConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl NfsConfig {
    pub fn port(&self) -> u16 {
        self.port.filter(|p| *p > 0).unwrap_or(DEFAULT_NFS_PORT)
    }
}

impl SmbConfig {
    pub fn port(&self) -> u16 {
        self.port.filter(|p| *p > 0).unwrap_or(DEFAULT_SMB_PORT)
    }
}

impl ImapConfig {
    pub fn port(&self) -> u16 {
        self.port.filter(|p| *p > 0).unwrap_or(DEFAULT_IMAP_PORT)
    }
}

impl Source {
    /// Protocol name as used in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Source::Nfs(_) => "nfs",
            Source::Smb(_) => "smb",
            Source::Imap(_) => "imap",
        }
    }

    /// Human readable identity used in logs
    pub fn label(&self) -> String {
        match self {
            Source::Nfs(c) => format!("nfs://{}:{}{}", c.host, c.port(), with_leading_slash(&c.folder)),
            Source::Smb(c) => format!(
                "smb://{}:{}/{}{}",
                c.host,
                c.port(),
                c.share,
                with_leading_slash(&c.folder)
            ),
            Source::Imap(c) => format!("imap://{}:{}/{}", c.host, c.port(), c.mailbox),
        }
    }

    /// Per-source timeout, if one is configured
    pub fn timeout(&self) -> Option<Duration> {
        let seconds = match self {
            Source::Nfs(c) => c.timeout_seconds,
            Source::Smb(c) => c.timeout_seconds,
            Source::Imap(c) => c.timeout_seconds,
        };
        seconds.filter(|s| *s > 0).map(Duration::from_secs)
    }

    fn validate(&self, index: usize, problems: &mut Vec<String>) {
        let mut require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                problems.push(format!("sources.{}.config.{} is required", index, field));
            }
        };

        match self {
            Source::Nfs(c) => {
                require(&c.host, "host");
                require(&c.folder, "folder");
            }
            Source::Smb(c) => {
                require(&c.host, "host");
                require(&c.share, "share");
                require(&c.folder, "folder");
            }
            Source::Imap(c) => {
                require(&c.host, "host");
                require(&c.mailbox, "mailbox");
                if c.filter_field.is_some() {
                    require(&c.filter_value, "filter_value");
                }
            }
        }
    }
}

fn with_leading_slash(folder: &str) -> String {
    if folder.starts_with('/') {
        folder.to_string()
    } else {
        format!("/{}", folder)
    }
}

impl Config {
    /// Resolve the configuration file location
    ///
    /// An explicit path wins. Otherwise `./config.yaml` is used when present,
    /// falling back to the XDG config location.
    pub fn resolve_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path);
        }

        let local = PathBuf::from("config.yaml");
        if local.exists() {
            return Ok(local);
        }

        Self::default_config_path()
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("bookshift").join("config.yaml"))
    }

    /// Load and validate configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.target_folder.trim().is_empty() {
            problems.push("target_folder is required".to_string());
        }

        if self.valid_extensions.iter().all(|e| e.trim().is_empty()) {
            problems.push("valid_extensions must list at least one extension".to_string());
        }

        for (index, source) in self.sources.iter().enumerate() {
            source.validate(index, &mut problems);
        }

        if !problems.is_empty() {
            bail!(problems.join("\n"));
        }

        Ok(())
    }

    /// Expand environment variables and `~` in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.target_folder = shellexpand::full(&self.target_folder)
            .context("Failed to expand target_folder path")?
            .into_owned();

        Ok(())
    }

    pub fn target_folder(&self) -> PathBuf {
        PathBuf::from(&self.target_folder)
    }
}
