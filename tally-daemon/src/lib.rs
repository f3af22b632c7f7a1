//! Long-running sync service: interval scheduler + HTTP trigger.
//!
//! [`start_blocking`] is the `tally daemon start` entrypoint. The [`client`]
//! functions talk to a daemon that is already running.

pub mod client;
mod error;
mod http;
mod protocol;
mod runtime;

pub use client::{base_url, request_status, request_sync};
pub use error::DaemonError;
pub use protocol::{ErrorBody, SyncStatus, HEALTH_PATH, SYNC_PATH};
pub use runtime::{init_tracing, run, run_until_shutdown, start_blocking, SyncGate, SyncPermit};
