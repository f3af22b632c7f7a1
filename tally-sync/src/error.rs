//! Error types for tally-sync.

use chrono::{DateTime, Utc};
use thiserror::Error;

use tally_core::{RunId, RunStatus};
use tally_sheets::SourceError;

use crate::store::StoreError;

/// Why a sync did not complete.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The sheet could not be fetched.
    #[error("source fetch failed: {0}")]
    Source(#[from] SourceError),

    /// Reading or writing the transaction table or ledger failed.
    #[error("storage error: {0}")]
    Store(StoreError),

    /// A run was finalised twice. Indicates a defect, never retried.
    #[error("ledger invariant violated: run {run_id} is already {status}")]
    LedgerInvariant { run_id: RunId, status: RunStatus },

    /// Another run holds the ledger lease.
    #[error("sync run {run_id} already in progress since {started_at}")]
    AlreadyRunning {
        run_id: RunId,
        started_at: DateTime<Utc>,
    },

    /// The run was cancelled between chunks.
    #[error("sync cancelled")]
    Cancelled,
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RunNotRunning { id, status } => SyncError::LedgerInvariant {
                run_id: id,
                status,
            },
            StoreError::RunInProgress { id, started_at } => SyncError::AlreadyRunning {
                run_id: id,
                started_at,
            },
            other => SyncError::Store(other),
        }
    }
}

impl SyncError {
    /// True for a rejected start: no ledger entry was written for this attempt.
    pub fn is_already_running(&self) -> bool {
        matches!(self, SyncError::AlreadyRunning { .. })
    }
}
