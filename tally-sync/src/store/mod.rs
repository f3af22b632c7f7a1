//! Storage ports: the transaction table and the run ledger.
//!
//! The engine only talks to these traits. [`SqliteStore`] is the production
//! backend; [`MemoryStore`] is an in-process fake for tests.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use tally_core::{RowNumber, RunId, RunStatus, SyncCounts, SyncRun, TransactionFields, TransactionRecord};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored value could not be read back into its domain type.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// An update targeted a row that no longer exists.
    #[error("transaction row {0} not found for update")]
    MissingRow(RowNumber),

    /// An insert targeted a row that is already stored.
    #[error("transaction row {0} already stored")]
    DuplicateRow(RowNumber),

    #[error("sync run {0} not found")]
    RunNotFound(RunId),

    /// The run already reached a terminal state.
    #[error("sync run {id} is {status}, not running")]
    RunNotRunning { id: RunId, status: RunStatus },

    /// A live run holds the lease.
    #[error("sync run {id} has been running since {started_at}")]
    RunInProgress {
        id: RunId,
        started_at: DateTime<Utc>,
    },

    /// Backend unavailable or refused the operation.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// One insert or update produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub row_number: RowNumber,
    pub fields: TransactionFields,
    pub row_hash: String,
}

/// The persisted transaction table.
pub trait TransactionStore {
    /// Full `row_number → row_hash` snapshot.
    fn load_baseline(&self) -> Result<HashMap<RowNumber, String>, StoreError>;

    /// Apply `changes` in one storage transaction. Inserts stamp `created_at`
    /// and `updated_at`; updates rewrite every field and the hash and stamp
    /// `updated_at`.
    fn apply_changes(&mut self, changes: &[RowChange], now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete `rows` in one storage transaction; returns how many existed.
    fn delete_rows(&mut self, rows: &[RowNumber]) -> Result<usize, StoreError>;

    /// Every stored row, ordered by row number.
    fn list_transactions(&self) -> Result<Vec<TransactionRecord>, StoreError>;
}

/// The run ledger. Entries move from `running` to a terminal state once.
pub trait RunLedger {
    /// Open a `running` entry. Fails with [`StoreError::RunInProgress`] while
    /// another entry younger than `lease` is running; older ones are failed
    /// as abandoned first.
    fn create_run(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<SyncRun, StoreError>;

    fn complete_run(
        &mut self,
        id: RunId,
        counts: SyncCounts,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError>;

    fn fail_run(&mut self, id: RunId, message: &str, now: DateTime<Utc>) -> Result<SyncRun, StoreError>;

    /// Most recent entry by start time, ties broken by id.
    fn last_run(&self) -> Result<Option<SyncRun>, StoreError>;

    /// Up to `limit` entries, newest first.
    fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;
}

/// Message written to a stale `running` entry when a new run takes over.
pub(crate) fn abandoned_message(lease: Duration) -> String {
    format!(
        "abandoned: still running after the {} minute lease expired",
        lease.num_minutes()
    )
}

/// Whether a run started at `started_at` still holds the lease at `now`.
pub(crate) fn holds_lease(started_at: DateTime<Utc>, now: DateTime<Utc>, lease: Duration) -> bool {
    now.signed_duration_since(started_at) < lease
}
