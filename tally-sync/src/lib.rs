//! # tally-sync
//!
//! Spreadsheet-to-database reconciliation with a run ledger.
//!
//! Call [`pipeline::run`] to sync the configured source into the configured
//! database, or build a [`SyncEngine`] over any [`SheetSource`] and store.
//!
//! [`SheetSource`]: tally_sheets::SheetSource

pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod pipeline;
pub mod store;

pub use engine::{CancelFlag, SyncEngine, SyncOptions, SyncReport};
pub use error::SyncError;
pub use fingerprint::{fingerprint, is_blank};
pub use store::{
    ChangeKind, MemoryStore, RowChange, RunLedger, SqliteStore, StoreError, TransactionStore,
};
