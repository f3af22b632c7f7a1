//! Reconciliation engine.
//!
//! One [`SyncEngine::sync`] call is one ledger entry:
//!
//! 1. open a `running` run (fails fast while another run holds the lease)
//! 2. fetch header + rows; an empty source completes with zero counts
//! 3. build the header map
//! 4. load the full `row_number → row_hash` baseline
//! 5. walk rows in order, `row_number = position + 2`; blank rows are seen
//!    but never written
//! 6. apply inserts/updates chunk by chunk, one storage transaction each
//! 7. delete `baseline − seen` in one storage transaction
//! 8. complete the run
//!
//! Any failure after step 1 marks the run `failed` and is returned. Chunks
//! committed before the failure stay committed; the next run converges.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{normalize_row, HeaderIndexMap, HeaderTable, RowNumber, RunId, SyncCounts, TallyConfig};
use tally_sheets::SheetSource;

use crate::error::SyncError;
use crate::fingerprint::{fingerprint, is_blank};
use crate::store::{ChangeKind, RowChange, RunLedger, TransactionStore};

/// Tunables for one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Rows per insert/update chunk.
    pub batch_size: usize,
    /// How long a `running` ledger entry blocks new runs.
    pub lease: Duration,
    pub headers: HeaderTable,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            lease: Duration::minutes(120),
            headers: HeaderTable::default(),
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &TallyConfig) -> Self {
        let minutes = i64::try_from(config.sync.lease_minutes).unwrap_or(i64::MAX);
        Self {
            batch_size: config.sync.batch_size,
            lease: Duration::try_minutes(minutes).unwrap_or(Duration::MAX),
            headers: config.header_table(),
        }
    }
}

/// Cooperative cancellation shared between a trigger and a running engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a completed run, as returned to triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: RunId,
    #[serde(flatten)]
    pub counts: SyncCounts,
}

pub struct SyncEngine<Src, St> {
    source: Src,
    store: St,
    options: SyncOptions,
    cancel: CancelFlag,
}

impl<Src, St> SyncEngine<Src, St>
where
    Src: SheetSource,
    St: TransactionStore + RunLedger,
{
    pub fn new(source: Src, store: St, options: SyncOptions) -> Self {
        Self {
            source,
            store,
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut St {
        &mut self.store
    }

    pub fn into_store(self) -> St {
        self.store
    }

    /// Run one reconciliation pass.
    pub fn sync(&mut self) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let run = self.store.create_run(Utc::now(), self.options.lease)?;
        tracing::info!(run_id = %run.id, source = %self.source.describe(), "sync run started");

        let outcome = self.reconcile().and_then(|counts| {
            self.store.complete_run(run.id, counts, Utc::now())?;
            Ok(counts)
        });
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(counts) => {
                tracing::info!(
                    run_id = %run.id,
                    total = counts.total_rows,
                    inserted = counts.inserted_rows,
                    updated = counts.updated_rows,
                    deleted = counts.deleted_rows,
                    duration_ms,
                    "sync run completed",
                );
                Ok(SyncReport {
                    run_id: run.id,
                    counts,
                })
            }
            Err(err) => {
                // A ledger invariant means the run is already terminal.
                if !matches!(err, SyncError::LedgerInvariant { .. }) {
                    if let Err(mark_err) = self.store.fail_run(run.id, &err.to_string(), Utc::now()) {
                        tracing::error!(run_id = %run.id, error = %mark_err, "could not mark sync run failed");
                    }
                }
                tracing::error!(run_id = %run.id, error = %err, duration_ms, "sync run failed");
                Err(err)
            }
        }
    }

    fn reconcile(&mut self) -> Result<SyncCounts, SyncError> {
        let data = self.source.fetch()?;
        if data.is_empty() {
            tracing::info!("source returned no header and no rows; nothing to reconcile");
            return Ok(SyncCounts::default());
        }

        let map = HeaderIndexMap::build(&data.headers, &self.options.headers);
        let missing = map.missing();
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(|f| f.as_str()).collect();
            tracing::debug!(missing = ?names, "headers not found; these fields read as null");
        }

        let baseline = self.store.load_baseline()?;
        let mut seen: HashSet<RowNumber> = HashSet::with_capacity(data.rows.len());
        let mut counts = SyncCounts {
            total_rows: data.rows.len(),
            ..SyncCounts::default()
        };

        let batch_size = self.options.batch_size.max(1);
        for (chunk_idx, chunk) in data.rows.chunks(batch_size).enumerate() {
            self.check_cancelled()?;

            let offset = chunk_idx * batch_size;
            let mut changes = Vec::new();
            for (i, cells) in chunk.iter().enumerate() {
                let row_number = RowNumber::from_position(offset + i);
                seen.insert(row_number);
                if is_blank(cells) {
                    continue;
                }

                let row_hash = fingerprint(cells);
                let kind = match baseline.get(&row_number) {
                    None => ChangeKind::Insert,
                    Some(stored) if *stored != row_hash => ChangeKind::Update,
                    Some(_) => continue,
                };
                changes.push(RowChange {
                    kind,
                    row_number,
                    fields: normalize_row(cells, &map),
                    row_hash,
                });
            }

            if changes.is_empty() {
                continue;
            }
            let inserted = changes
                .iter()
                .filter(|c| c.kind == ChangeKind::Insert)
                .count();
            self.store.apply_changes(&changes, Utc::now())?;
            counts.inserted_rows += inserted;
            counts.updated_rows += changes.len() - inserted;
            tracing::debug!(
                chunk = chunk_idx,
                inserted,
                updated = changes.len() - inserted,
                "applied chunk",
            );
        }

        self.check_cancelled()?;
        let mut to_delete: Vec<RowNumber> = baseline
            .keys()
            .filter(|row| !seen.contains(row))
            .copied()
            .collect();
        to_delete.sort();
        counts.deleted_rows = self.store.delete_rows(&to_delete)?;

        Ok(counts)
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tally_core::RunStatus;
    use tally_sheets::{SheetData, SourceError};

    struct Fixed(SheetData);

    impl SheetSource for Fixed {
        fn fetch(&self) -> Result<SheetData, SourceError> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "fixed".to_string()
        }
    }

    fn sheet(rows: &[&[&str]]) -> SheetData {
        SheetData::from_values(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn report_serializes_flat_camel_case() {
        let report = SyncReport {
            run_id: RunId(3),
            counts: SyncCounts {
                total_rows: 4,
                inserted_rows: 1,
                updated_rows: 2,
                deleted_rows: 0,
            },
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"runId": 3, "totalRows": 4, "insertedRows": 1, "updatedRows": 2, "deletedRows": 0})
        );
    }

    #[test]
    fn chunks_are_applied_separately() {
        let source = Fixed(sheet(&[
            &["Date", "Vendor"],
            &["2024-01-01", "a"],
            &["2024-01-02", "b"],
            &["2024-01-03", "c"],
            &["2024-01-04", "d"],
            &["2024-01-05", "e"],
        ]));
        let options = SyncOptions {
            batch_size: 2,
            ..SyncOptions::default()
        };
        let mut engine = SyncEngine::new(source, MemoryStore::new(), options);
        let report = engine.sync().unwrap();
        assert_eq!(report.counts.inserted_rows, 5);
        assert_eq!(engine.store().apply_calls(), 3);
    }

    #[test]
    fn zero_batch_size_is_treated_as_one() {
        let source = Fixed(sheet(&[&["Vendor"], &["a"], &["b"]]));
        let options = SyncOptions {
            batch_size: 0,
            ..SyncOptions::default()
        };
        let mut engine = SyncEngine::new(source, MemoryStore::new(), options);
        assert_eq!(engine.sync().unwrap().counts.inserted_rows, 2);
    }

    #[test]
    fn header_only_sheet_deletes_everything() {
        let mut engine = SyncEngine::new(
            Fixed(sheet(&[&["Vendor"], &["a"], &["b"]])),
            MemoryStore::new(),
            SyncOptions::default(),
        );
        engine.sync().unwrap();

        let store = engine.into_store();
        let mut engine = SyncEngine::new(Fixed(sheet(&[&["Vendor"]])), store, SyncOptions::default());
        let report = engine.sync().unwrap();
        assert_eq!(report.counts.deleted_rows, 2);
        assert!(engine.store().list_transactions().unwrap().is_empty());
    }

    #[test]
    fn empty_source_completes_without_deleting() {
        let mut engine = SyncEngine::new(
            Fixed(sheet(&[&["Vendor"], &["a"]])),
            MemoryStore::new(),
            SyncOptions::default(),
        );
        engine.sync().unwrap();

        let store = engine.into_store();
        let mut engine = SyncEngine::new(Fixed(SheetData::default()), store, SyncOptions::default());
        let report = engine.sync().unwrap();
        assert_eq!(report.counts, SyncCounts::default());
        assert_eq!(engine.store().list_transactions().unwrap().len(), 1);
        let last = engine.store().last_run().unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Completed);
    }

    #[test]
    fn options_follow_config() {
        let mut config = TallyConfig::default();
        config.sync.batch_size = 50;
        config.sync.lease_minutes = 15;
        let options = SyncOptions::from_config(&config);
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.lease, Duration::minutes(15));
    }
}
