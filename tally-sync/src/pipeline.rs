//! Shared sync entrypoint used by the CLI and the daemon.

use std::path::Path;

use chrono::Utc;

use tally_core::{SyncRun, TallyConfig};

use crate::engine::{CancelFlag, SyncEngine, SyncOptions, SyncReport};
use crate::error::SyncError;
use crate::store::{RunLedger, SqliteStore};

/// Run one sync against the configured source and database.
pub fn run(config: &TallyConfig, home: &Path, cancel: CancelFlag) -> Result<SyncReport, SyncError> {
    let options = SyncOptions::from_config(config);
    let mut store = SqliteStore::open(&config.database_path(home))?;

    let source = match tally_sheets::from_config(&config.source) {
        Ok(source) => source,
        Err(err) => return Err(record_failed_attempt(&mut store, &options, err.into())),
    };

    SyncEngine::new(source, store, options)
        .with_cancel(cancel)
        .sync()
}

/// Most recent ledger entry, if any run has happened.
pub fn last_run(config: &TallyConfig, home: &Path) -> Result<Option<SyncRun>, SyncError> {
    let store = SqliteStore::open(&config.database_path(home))?;
    Ok(store.last_run()?)
}

/// Up to `limit` ledger entries, newest first.
pub fn recent_runs(config: &TallyConfig, home: &Path, limit: usize) -> Result<Vec<SyncRun>, SyncError> {
    let store = SqliteStore::open(&config.database_path(home))?;
    Ok(store.recent_runs(limit)?)
}

/// The source could not even be built. Record the attempt so the ledger
/// still shows why the data is stale.
fn record_failed_attempt<St: RunLedger>(store: &mut St, options: &SyncOptions, err: SyncError) -> SyncError {
    let now = Utc::now();
    match store.create_run(now, options.lease) {
        Ok(run) => {
            if let Err(mark_err) = store.fail_run(run.id, &err.to_string(), now) {
                tracing::error!(run_id = %run.id, error = %mark_err, "could not mark sync run failed");
            }
            tracing::error!(run_id = %run.id, error = %err, "sync run failed");
            err
        }
        Err(lease_err) => lease_err.into(),
    }
}
