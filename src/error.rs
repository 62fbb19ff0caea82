//! Error types for the sync engine and the library rescan trigger

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while syncing a source or running the orchestrator
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote endpoint was unreachable or refused the credentials
    #[error("could not connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Listing the remote root (or a sub-tree under a strict policy) failed
    #[error("could not list {path} on {endpoint}: {reason}")]
    List {
        endpoint: String,
        path: String,
        reason: String,
    },

    /// Streaming or writing a file failed; no partial file is left behind
    #[error("could not download {name} into {}: {source}", .folder.display())]
    Download {
        name: String,
        folder: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The local copy succeeded but the remote original could not be removed
    #[error("downloaded {item} but could not delete it from {endpoint}: {reason}")]
    Delete {
        endpoint: String,
        item: String,
        reason: String,
    },

    /// The target folder could not be enumerated
    #[error("could not count files in {}: {source}", .folder.display())]
    Count {
        folder: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("sync cancelled")]
    Cancelled,

    #[error("sync timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// The worker running a source panicked or was aborted
    #[error("sync worker failed: {0}")]
    Task(String),

    #[error(transparent)]
    Rescan(#[from] RescanError),
}

/// Errors raised by the library rescan trigger
#[derive(Debug, Error)]
pub enum RescanError {
    #[error("rescan service unavailable: {0}")]
    Unavailable(String),

    #[error("library rescan request failed: {0}")]
    Request(String),

    #[error("library rescan timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("library rescan error: expected '{expected}', got '{got}'")]
    SignalMismatch { expected: String, got: String },

    #[error("library rescan notification channel closed before completion")]
    ChannelClosed,

    #[error("library rescan cancelled")]
    Cancelled,
}
