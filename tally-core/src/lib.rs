//! Tally core library — domain types, header mapping, row normalisation, config.
//!
//! Public API surface:
//! - [`types`] — newtypes and ledger/transaction structs
//! - [`headers`] — canonical fields and the per-run [`HeaderIndexMap`]
//! - [`normalize`] — permissive cell parsers and [`normalize_row`]
//! - [`config`] — `~/.tally/config.yaml` load / save / init
//! - [`error`] — [`ConfigError`]

pub mod config;
pub mod error;
pub mod headers;
pub mod normalize;
pub mod types;

pub use config::{
    LoggingSettings, ScheduleSettings, ServerSettings, SourceConfig, SyncSettings, TallyConfig,
};
pub use error::ConfigError;
pub use headers::{CanonicalField, HeaderIndexMap, HeaderTable};
pub use normalize::normalize_row;
pub use types::{
    RowNumber, RunId, RunStatus, SyncCounts, SyncRun, TransactionFields, TransactionRecord,
};
