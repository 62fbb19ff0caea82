//! BookShift - E-book sync for e-readers
//!
//! BookShift pulls e-books from NFS exports, SMB shares and IMAP mailbox
//! attachments into a local folder, then asks a Kobo e-reader to rescan its
//! library when new books arrived.
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration and source definitions
//! - [`sync`]: The orchestrator running all sources with bounded concurrency
//! - [`source`]: Per-protocol syncers and their capability traits
//! - [`download`]: Atomic single-file downloads and filename rules
//! - [`counter`]: Counting books in the target folder
//! - [`rescan`]: Library rescan state machine
//! - [`nickel_dbus`]: NickelDbus and hardware status adapters
//! - [`kobo`]: Device detection and uninstall

pub mod config;
pub mod counter;
pub mod download;
pub mod error;
pub mod kobo;
pub mod nickel_dbus;
pub mod rescan;
pub mod source;
pub mod sync;

pub use config::{Config, Source};
pub use download::{AtomicFileWriter, DownloadOutcome, ExtensionFilter, RunOptions};
pub use error::{RescanError, SyncError};
pub use sync::{SourceReport, SyncEngine, SyncSummary};
