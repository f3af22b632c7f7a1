//! End-to-end reconciliation behaviour against the in-memory and SQLite stores.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::str::FromStr;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use tally_core::{
    normalize_row, HeaderIndexMap, HeaderTable, RowNumber, RunStatus, SyncCounts, SyncRun,
    TransactionFields, TransactionRecord,
};
use tally_sheets::{SheetData, SheetSource, SourceError};
use tally_sync::store::memory::Fault;
use tally_sync::{
    CancelFlag, MemoryStore, RunLedger, SqliteStore, StoreError, SyncEngine, SyncError,
    SyncOptions, TransactionStore,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const HEADER: &[&str] = &["วันที่", "ผู้ขาย", "รายละเอียด", "ราคารวม", "ภาษีมูลค่าเพิ่ม"];

fn cells(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn sheet(rows: &[&[&str]]) -> SheetData {
    SheetData {
        headers: cells(HEADER),
        rows: rows.iter().map(|r| cells(r)).collect(),
    }
}

/// A source whose contents can be edited between runs.
#[derive(Clone, Default)]
struct EditableSheet(Rc<RefCell<SheetData>>);

impl EditableSheet {
    fn new(data: SheetData) -> Self {
        Self(Rc::new(RefCell::new(data)))
    }

    fn set(&self, data: SheetData) {
        *self.0.borrow_mut() = data;
    }
}

impl SheetSource for EditableSheet {
    fn fetch(&self) -> Result<SheetData, SourceError> {
        Ok(self.0.borrow().clone())
    }

    fn describe(&self) -> String {
        "editable".to_string()
    }
}

struct Unreachable;

impl SheetSource for Unreachable {
    fn fetch(&self) -> Result<SheetData, SourceError> {
        Err(SourceError::Transport("connection refused".to_string()))
    }

    fn describe(&self) -> String {
        "unreachable".to_string()
    }
}

fn engine<St: TransactionStore + RunLedger>(source: &EditableSheet, store: St) -> SyncEngine<EditableSheet, St> {
    SyncEngine::new(source.clone(), store, SyncOptions::default())
}

fn row_numbers(records: &[TransactionRecord]) -> BTreeSet<i64> {
    records.iter().map(|r| r.row_number.0).collect()
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("decimal")
}

fn counts(total: usize, inserted: usize, updated: usize, deleted: usize) -> SyncCounts {
    SyncCounts {
        total_rows: total,
        inserted_rows: inserted,
        updated_rows: updated,
        deleted_rows: deleted,
    }
}

const ROW_A: &[&str] = &["05/01/2024", "Office Mart", "paper", "100", "7"];
const ROW_B: &[&str] = &["06/01/2024", "Fuel Co", "diesel", "1,500.00", "105.00"];
const ROW_C: &[&str] = &["07/01/2024", "Cafe", "meeting", "240", ""];
const ROW_D: &[&str] = &["2024-01-08", "Courier", "shipping", "80", "5.60"];

// ---------------------------------------------------------------------------
// Idempotence and convergence
// ---------------------------------------------------------------------------

#[test]
fn second_run_on_unchanged_source_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("tally.db")).unwrap();
    let source = EditableSheet::new(sheet(&[ROW_A, ROW_B, ROW_C]));

    let mut first = engine(&source, store);
    assert_eq!(first.sync().unwrap().counts, counts(3, 3, 0, 0));
    let before = first.store().list_transactions().unwrap();

    let mut second = engine(&source, first.into_store());
    let report = second.sync().unwrap();
    assert_eq!(report.counts, counts(3, 0, 0, 0));
    assert!(report.counts.is_noop());

    let after = second.store().list_transactions().unwrap();
    assert_eq!(before, after, "stored table must be identical after a no-op run");
}

#[test]
fn stored_rows_equal_normalized_source_rows() {
    let source = EditableSheet::new(sheet(&[ROW_A, &["", " ", ""], ROW_B, ROW_D]));
    let mut engine = engine(&source, MemoryStore::new());
    engine.sync().unwrap();

    let stored = engine.store().list_transactions().unwrap();
    assert_eq!(row_numbers(&stored), BTreeSet::from([2, 4, 5]));

    let map = HeaderIndexMap::build(&cells(HEADER), &HeaderTable::default());
    let expected: HashMap<i64, TransactionFields> = [(2, ROW_A), (4, ROW_B), (5, ROW_D)]
        .into_iter()
        .map(|(row, raw)| (row, normalize_row(&cells(raw), &map)))
        .collect();
    for record in &stored {
        assert_eq!(record.fields, expected[&record.row_number.0], "row {}", record.row_number);
        assert_eq!(record.row_hash.len(), 64);
    }
}

// ---------------------------------------------------------------------------
// Change detection
// ---------------------------------------------------------------------------

#[test]
fn reformatted_but_equal_amount_counts_as_update() {
    let source = EditableSheet::new(sheet(&[ROW_A]));
    let mut first = engine(&source, MemoryStore::new());
    first.sync().unwrap();
    let before = first.store().list_transactions().unwrap();

    source.set(sheet(&[&["05/01/2024", "Office Mart", "paper", "100.0", "7"]]));
    let mut second = engine(&source, first.into_store());
    assert_eq!(second.sync().unwrap().counts, counts(1, 0, 1, 0));

    let after = second.store().list_transactions().unwrap();
    assert_eq!(after[0].fields.total_price, before[0].fields.total_price);
    assert_ne!(after[0].row_hash, before[0].row_hash);
}

#[test]
fn removing_a_middle_row_shifts_later_rows() {
    let source = EditableSheet::new(sheet(&[ROW_A, ROW_B, ROW_C, ROW_D]));
    let mut first = engine(&source, MemoryStore::new());
    first.sync().unwrap();

    // Drop B: C and D move up one position each, row 5 disappears.
    source.set(sheet(&[ROW_A, ROW_C, ROW_D]));
    let mut second = engine(&source, first.into_store());
    assert_eq!(second.sync().unwrap().counts, counts(3, 0, 2, 1));

    let stored = second.store().list_transactions().unwrap();
    assert_eq!(row_numbers(&stored), BTreeSet::from([2, 3, 4]));
    assert_eq!(stored[1].fields.vendor.as_deref(), Some("Cafe"));
    assert_eq!(stored[2].fields.vendor.as_deref(), Some("Courier"));
}

#[test]
fn row_that_goes_blank_is_neither_updated_nor_deleted() {
    let source = EditableSheet::new(sheet(&[ROW_A, ROW_B]));
    let mut first = engine(&source, MemoryStore::new());
    first.sync().unwrap();
    let before = first.store().list_transactions().unwrap();

    source.set(sheet(&[ROW_A, &["", "", "", "", ""]]));
    let mut second = engine(&source, first.into_store());
    assert_eq!(second.sync().unwrap().counts, counts(2, 0, 0, 0));

    // Documented behaviour: the stale row 3 keeps its old content.
    let after = second.store().list_transactions().unwrap();
    assert_eq!(before, after);
    assert_eq!(after[1].fields.vendor.as_deref(), Some("Fuel Co"));
}

#[test]
fn blank_rows_count_toward_total_only() {
    let source = EditableSheet::new(sheet(&[&[""], ROW_A, &["  ", "\t"]]));
    let mut engine = engine(&source, MemoryStore::new());
    assert_eq!(engine.sync().unwrap().counts, counts(3, 1, 0, 0));
    assert_eq!(
        row_numbers(&engine.store().list_transactions().unwrap()),
        BTreeSet::from([3])
    );
}

#[test]
fn missing_header_reads_as_null_without_failing() {
    let source = EditableSheet::new(SheetData {
        headers: cells(&["Vendor", "Mystery"]),
        rows: vec![cells(&["ACME", "42"])],
    });
    let mut engine = engine(&source, MemoryStore::new());
    engine.sync().unwrap();

    let stored = engine.store().list_transactions().unwrap();
    assert_eq!(stored[0].fields.vendor.as_deref(), Some("ACME"));
    assert_eq!(stored[0].fields.date, None);
    assert_eq!(stored[0].fields.total_price, None);
}

// ---------------------------------------------------------------------------
// Decimal exactness
// ---------------------------------------------------------------------------

#[test]
fn total_with_vat_is_exact_through_sqlite() {
    let store = SqliteStore::open_in_memory().unwrap();
    let source = EditableSheet::new(sheet(&[&["2024-02-01", "Vendor", "x", "123.45", "8.64"]]));
    let mut engine = engine(&source, store);
    engine.sync().unwrap();

    let stored = engine.store().list_transactions().unwrap();
    assert_eq!(stored[0].fields.total_with_vat, Some(dec("132.09")));
    assert_eq!(
        stored[0].fields.total_with_vat.map(|d| d.to_string()).as_deref(),
        Some("132.09")
    );
}

#[test]
fn amount_at_decimal_max_stores_null_total_with_vat() {
    let store = SqliteStore::open_in_memory().unwrap();
    let huge = "79228162514264337593543950335";
    let source = EditableSheet::new(sheet(&[&["2024-02-01", "Vendor", "x", huge, "1"], ROW_A]));
    let mut engine = engine(&source, store);
    assert_eq!(engine.sync().unwrap().counts, counts(2, 2, 0, 0));

    let stored = engine.store().list_transactions().unwrap();
    assert_eq!(stored[0].fields.total_price, Some(dec(huge)));
    assert_eq!(stored[0].fields.vat_amount, Some(dec("1")));
    assert_eq!(stored[0].fields.total_with_vat, None);
    assert_eq!(stored[1].fields.total_with_vat, Some(dec("107")));
    assert_eq!(
        engine.store().last_run().unwrap().map(|r| r.status),
        Some(RunStatus::Completed)
    );
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[test]
fn source_failure_marks_exactly_one_run_failed() {
    let source = EditableSheet::new(sheet(&[ROW_A]));
    let mut first = engine(&source, MemoryStore::new());
    first.sync().unwrap();
    let before = first.store().list_transactions().unwrap();

    let mut broken = SyncEngine::new(Unreachable, first.into_store(), SyncOptions::default());
    let err = broken.sync().unwrap_err();
    assert!(matches!(err, SyncError::Source(_)), "got: {err}");

    let runs = broken.store().recent_runs(10).unwrap();
    assert_eq!(runs.len(), 2);
    let failed: &SyncRun = &runs[0];
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("connection refused")));
    assert_eq!(failed.counts, SyncCounts::default());
    assert!(failed.completed_at.is_some());
    assert_eq!(broken.store().list_transactions().unwrap(), before);
}

#[test]
fn storage_failure_mid_run_keeps_committed_chunks_and_converges_on_rerun() {
    let source = EditableSheet::new(sheet(&[ROW_A, ROW_B, ROW_C, ROW_D]));
    let mut store = MemoryStore::new();
    store.inject(Fault::ApplyChanges { from_call: 2 });

    let options = SyncOptions {
        batch_size: 2,
        ..SyncOptions::default()
    };
    let mut failing = SyncEngine::new(source.clone(), store, options.clone());
    let err = failing.sync().unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Backend(_))), "got: {err}");
    assert_eq!(failing.store().list_transactions().unwrap().len(), 2);
    assert_eq!(
        failing.store().last_run().unwrap().map(|r| r.status),
        Some(RunStatus::Failed)
    );

    let mut store = failing.into_store();
    store.clear_faults();
    let mut retry = SyncEngine::new(source, store, options);
    assert_eq!(retry.sync().unwrap().counts, counts(4, 2, 0, 0));
    assert_eq!(retry.store().list_transactions().unwrap().len(), 4);
}

#[test]
fn delete_failure_marks_run_failed() {
    let source = EditableSheet::new(sheet(&[ROW_A, ROW_B]));
    let mut first = engine(&source, MemoryStore::new());
    first.sync().unwrap();

    let mut store = first.into_store();
    store.inject(Fault::DeleteRows);
    source.set(sheet(&[ROW_A]));
    let mut second = engine(&source, store);
    assert!(second.sync().is_err());
    assert_eq!(
        second.store().last_run().unwrap().map(|r| r.status),
        Some(RunStatus::Failed)
    );
}

/// Finalises every run as soon as it is created, so the engine's own
/// finalisation hits a terminal run.
struct PreFinalized(MemoryStore);

impl TransactionStore for PreFinalized {
    fn load_baseline(&self) -> Result<HashMap<RowNumber, String>, StoreError> {
        self.0.load_baseline()
    }
    fn apply_changes(
        &mut self,
        changes: &[tally_sync::RowChange],
        now: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.0.apply_changes(changes, now)
    }
    fn delete_rows(&mut self, rows: &[RowNumber]) -> Result<usize, StoreError> {
        self.0.delete_rows(rows)
    }
    fn list_transactions(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        self.0.list_transactions()
    }
}

impl RunLedger for PreFinalized {
    fn create_run(&mut self, now: chrono::DateTime<Utc>, lease: Duration) -> Result<SyncRun, StoreError> {
        let run = self.0.create_run(now, lease)?;
        self.0.complete_run(run.id, SyncCounts::default(), now)?;
        Ok(run)
    }
    fn complete_run(
        &mut self,
        id: tally_core::RunId,
        counts: SyncCounts,
        now: chrono::DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        self.0.complete_run(id, counts, now)
    }
    fn fail_run(
        &mut self,
        id: tally_core::RunId,
        message: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        self.0.fail_run(id, message, now)
    }
    fn last_run(&self) -> Result<Option<SyncRun>, StoreError> {
        self.0.last_run()
    }
    fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.0.recent_runs(limit)
    }
}

#[test]
fn finalising_a_terminal_run_is_a_ledger_invariant_error() {
    let source = EditableSheet::new(sheet(&[ROW_A]));
    let mut engine = engine(&source, PreFinalized(MemoryStore::new()));
    let err = engine.sync().unwrap_err();
    assert!(
        matches!(err, SyncError::LedgerInvariant { status: RunStatus::Completed, .. }),
        "got: {err}"
    );
    // The terminal run is left as it was.
    let run = engine.store().last_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.error_message, None);
}

// ---------------------------------------------------------------------------
// End-to-end scenario
// ---------------------------------------------------------------------------

#[test]
fn unchanged_edited_and_removed_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tally.db");
    let source = EditableSheet::new(sheet(&[ROW_A, ROW_B, ROW_C]));

    let mut seed = engine(&source, SqliteStore::open(&path).unwrap());
    seed.sync().unwrap();
    let seeded = seed.store().list_transactions().unwrap();
    drop(seed);

    // A unchanged, B's amount edited, C (row 4) gone.
    source.set(sheet(&[ROW_A, &["06/01/2024", "Fuel Co", "diesel", "1,650.00", "115.50"]]));
    let mut engine = engine(&source, SqliteStore::open(&path).unwrap());
    let report = engine.sync().unwrap();
    assert_eq!(report.counts.inserted_rows, 0);
    assert_eq!(report.counts.updated_rows, 1);
    assert_eq!(report.counts.deleted_rows, 1);

    let stored = engine.store().list_transactions().unwrap();
    assert_eq!(row_numbers(&stored), BTreeSet::from([2, 3]));
    assert_eq!(stored[0], seeded[0], "row A untouched");
    assert_eq!(stored[1].fields.total_price, Some(dec("1650.00")));
    assert_eq!(stored[1].fields.total_with_vat, Some(dec("1765.50")));
    assert_eq!(stored[1].created_at, seeded[1].created_at);
    assert!(stored[1].updated_at >= seeded[1].updated_at);

    let last = engine.store().last_run().unwrap().unwrap();
    assert_eq!(last.id, report.run_id);
    assert_eq!(last.status, RunStatus::Completed);
    assert_eq!(last.counts, report.counts);
}

// ---------------------------------------------------------------------------
// Single flight and cancellation
// ---------------------------------------------------------------------------

#[test]
fn concurrent_start_is_rejected_without_a_new_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tally.db");

    let mut holder = SqliteStore::open(&path).unwrap();
    let live = holder.create_run(Utc::now(), Duration::minutes(120)).unwrap();

    let source = EditableSheet::new(sheet(&[ROW_A]));
    let mut engine = engine(&source, SqliteStore::open(&path).unwrap());
    let err = engine.sync().unwrap_err();
    assert!(
        matches!(err, SyncError::AlreadyRunning { run_id, .. } if run_id == live.id),
        "got: {err}"
    );
    assert!(err.is_already_running());

    let runs = engine.store().recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Running, "live run is left alone");
    assert!(engine.store().list_transactions().unwrap().is_empty());
}

#[test]
fn stale_running_entry_does_not_block_forever() {
    let mut store = MemoryStore::new();
    let stale = store
        .create_run(Utc::now() - Duration::hours(5), Duration::minutes(120))
        .unwrap();

    let source = EditableSheet::new(sheet(&[ROW_A]));
    let mut engine = engine(&source, store);
    let report = engine.sync().unwrap();
    assert_ne!(report.run_id, stale.id);

    let runs = engine.store().recent_runs(10).unwrap();
    let stale = runs.iter().find(|r| r.id == stale.id).unwrap();
    assert_eq!(stale.status, RunStatus::Failed);
}

#[test]
fn cancellation_between_chunks_fails_the_run() {
    let rows: Vec<Vec<String>> = (0..6)
        .map(|i| {
            let vendor = format!("vendor {i}");
            cells(&["2024-01-01", vendor.as_str(), "", "1", ""])
        })
        .collect();
    let source = EditableSheet::new(SheetData {
        headers: cells(HEADER),
        rows,
    });
    let cancel = CancelFlag::new();
    cancel.cancel();

    let options = SyncOptions {
        batch_size: 2,
        ..SyncOptions::default()
    };
    let mut engine = SyncEngine::new(source, MemoryStore::new(), options).with_cancel(cancel);
    let err = engine.sync().unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));

    let run = engine.store().last_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("sync cancelled"));
    assert!(engine.store().list_transactions().unwrap().is_empty());
}

/// Raises the cancel flag once the first chunk has been committed and counts
/// delete calls.
struct CancelAfterFirstChunk {
    inner: MemoryStore,
    cancel: CancelFlag,
    delete_calls: usize,
}

impl TransactionStore for CancelAfterFirstChunk {
    fn load_baseline(&self) -> Result<HashMap<RowNumber, String>, StoreError> {
        self.inner.load_baseline()
    }
    fn apply_changes(
        &mut self,
        changes: &[tally_sync::RowChange],
        now: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.apply_changes(changes, now)?;
        self.cancel.cancel();
        Ok(())
    }
    fn delete_rows(&mut self, rows: &[RowNumber]) -> Result<usize, StoreError> {
        self.delete_calls += 1;
        self.inner.delete_rows(rows)
    }
    fn list_transactions(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        self.inner.list_transactions()
    }
}

impl RunLedger for CancelAfterFirstChunk {
    fn create_run(&mut self, now: chrono::DateTime<Utc>, lease: Duration) -> Result<SyncRun, StoreError> {
        self.inner.create_run(now, lease)
    }
    fn complete_run(
        &mut self,
        id: tally_core::RunId,
        counts: SyncCounts,
        now: chrono::DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        self.inner.complete_run(id, counts, now)
    }
    fn fail_run(
        &mut self,
        id: tally_core::RunId,
        message: &str,
        now: chrono::DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        self.inner.fail_run(id, message, now)
    }
    fn last_run(&self) -> Result<Option<SyncRun>, StoreError> {
        self.inner.last_run()
    }
    fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.inner.recent_runs(limit)
    }
}

#[test]
fn cancellation_after_first_chunk_keeps_it_and_skips_deletes() {
    let vendor_rows = |prefix: &str, n: usize| -> Vec<Vec<String>> {
        (0..n)
            .map(|i| {
                let vendor = format!("{prefix} {i}");
                cells(&["2024-01-01", vendor.as_str(), "", "1", ""])
            })
            .collect()
    };
    let source = EditableSheet::new(SheetData {
        headers: cells(HEADER),
        rows: vendor_rows("old", 7),
    });
    let mut seed = engine(&source, MemoryStore::new());
    seed.sync().unwrap();

    // Every row edited and row 8 dropped: three chunks of updates plus a delete.
    source.set(SheetData {
        headers: cells(HEADER),
        rows: vendor_rows("new", 6),
    });
    let cancel = CancelFlag::new();
    let store = CancelAfterFirstChunk {
        inner: seed.into_store(),
        cancel: cancel.clone(),
        delete_calls: 0,
    };
    let options = SyncOptions {
        batch_size: 2,
        ..SyncOptions::default()
    };
    let mut cancelled = SyncEngine::new(source.clone(), store, options.clone()).with_cancel(cancel);
    let err = cancelled.sync().unwrap_err();
    assert!(matches!(err, SyncError::Cancelled), "got: {err}");

    let store = cancelled.into_store();
    assert_eq!(store.inner.apply_calls(), 2, "seed chunk plus the first edited chunk");
    assert_eq!(store.delete_calls, 0);
    let run = store.inner.last_run().unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("sync cancelled"));

    let stored = store.inner.list_transactions().unwrap();
    assert_eq!(row_numbers(&stored), (2..=8).collect::<BTreeSet<i64>>());
    let vendors: Vec<&str> = stored
        .iter()
        .map(|r| r.fields.vendor.as_deref().unwrap_or(""))
        .collect();
    assert_eq!(
        vendors,
        ["new 0", "new 1", "old 2", "old 3", "old 4", "old 5", "old 6"]
    );

    let mut retry = SyncEngine::new(source, store.inner, options);
    assert_eq!(retry.sync().unwrap().counts, counts(6, 0, 4, 1));
    assert_eq!(
        row_numbers(&retry.store().list_transactions().unwrap()),
        (2..=7).collect::<BTreeSet<i64>>()
    );
}
