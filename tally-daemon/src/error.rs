use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the daemon runtime, HTTP trigger and client.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] tally_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] tally_sync::SyncError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (no answer at {url})")]
    DaemonNotRunning { url: String },

    /// A sync is already in flight in this daemon.
    #[error("a sync is already in progress")]
    SyncInProgress,

    #[error("daemon rejected the sync secret")]
    Unauthorized,
}

impl DaemonError {
    /// True when the request lost a single-flight race, locally or in the ledger.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DaemonError::SyncInProgress | DaemonError::Sync(tally_sync::SyncError::AlreadyRunning { .. })
        )
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
