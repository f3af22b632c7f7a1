//! In-process store for tests and dry runs.
//!
//! Mirrors the SQLite semantics (one transaction per call, single-transition
//! ledger, lease check) and can be told to fail specific operations.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};

use tally_core::{RowNumber, RunId, RunStatus, SyncCounts, SyncRun, TransactionRecord};

use super::{abandoned_message, holds_lease, ChangeKind, RowChange, RunLedger, StoreError, TransactionStore};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    LoadBaseline,
    /// Fail the `n`th `apply_changes` call (1-based) and every call after it.
    ApplyChanges { from_call: usize },
    DeleteRows,
    CompleteRun,
    FailRun,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    rows: BTreeMap<RowNumber, TransactionRecord>,
    runs: Vec<SyncRun>,
    faults: Vec<Fault>,
    apply_calls: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    /// Number of `apply_changes` calls seen so far.
    pub fn apply_calls(&self) -> usize {
        self.apply_calls
    }

    pub fn runs(&self) -> &[SyncRun] {
        &self.runs
    }

    fn check(&self, fault: Fault) -> Result<(), StoreError> {
        if self.faults.contains(&fault) {
            return Err(StoreError::Backend(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }

    fn run_mut(&mut self, id: RunId) -> Result<&mut SyncRun, StoreError> {
        self.runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or(StoreError::RunNotFound(id))
    }

    fn finish_run(
        &mut self,
        id: RunId,
        status: RunStatus,
        counts: SyncCounts,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        let run = self.run_mut(id)?;
        if run.status.is_terminal() {
            return Err(StoreError::RunNotRunning {
                id,
                status: run.status,
            });
        }
        run.status = status;
        run.completed_at = Some(now);
        run.counts = counts;
        run.error_message = message.map(str::to_string);
        Ok(run.clone())
    }
}

impl TransactionStore for MemoryStore {
    fn load_baseline(&self) -> Result<HashMap<RowNumber, String>, StoreError> {
        self.check(Fault::LoadBaseline)?;
        Ok(self
            .rows
            .iter()
            .map(|(row, record)| (*row, record.row_hash.clone()))
            .collect())
    }

    fn apply_changes(&mut self, changes: &[RowChange], now: DateTime<Utc>) -> Result<(), StoreError> {
        self.apply_calls += 1;
        let calls = self.apply_calls;
        if self
            .faults
            .iter()
            .any(|f| matches!(f, Fault::ApplyChanges { from_call } if calls >= *from_call))
        {
            return Err(StoreError::Backend(format!(
                "injected fault: apply_changes call {calls}"
            )));
        }

        // Stage on a copy so a failure leaves nothing behind.
        let mut staged = self.rows.clone();
        for change in changes {
            match change.kind {
                ChangeKind::Insert => match staged.entry(change.row_number) {
                    Entry::Occupied(_) => return Err(StoreError::DuplicateRow(change.row_number)),
                    Entry::Vacant(slot) => {
                        slot.insert(TransactionRecord {
                            row_number: change.row_number,
                            fields: change.fields.clone(),
                            row_hash: change.row_hash.clone(),
                            created_at: now,
                            updated_at: now,
                        });
                    }
                },
                ChangeKind::Update => {
                    let record = staged
                        .get_mut(&change.row_number)
                        .ok_or(StoreError::MissingRow(change.row_number))?;
                    record.fields = change.fields.clone();
                    record.row_hash = change.row_hash.clone();
                    record.updated_at = now;
                }
            }
        }
        self.rows = staged;
        Ok(())
    }

    fn delete_rows(&mut self, rows: &[RowNumber]) -> Result<usize, StoreError> {
        self.check(Fault::DeleteRows)?;
        Ok(rows
            .iter()
            .filter(|row| self.rows.remove(*row).is_some())
            .count())
    }

    fn list_transactions(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        Ok(self.rows.values().cloned().collect())
    }
}

impl RunLedger for MemoryStore {
    fn create_run(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<SyncRun, StoreError> {
        if let Some(live) = self
            .runs
            .iter()
            .find(|run| run.status == RunStatus::Running && holds_lease(run.started_at, now, lease))
        {
            return Err(StoreError::RunInProgress {
                id: live.id,
                started_at: live.started_at,
            });
        }
        for run in self.runs.iter_mut().filter(|r| r.status == RunStatus::Running) {
            run.status = RunStatus::Failed;
            run.completed_at = Some(now);
            run.error_message = Some(abandoned_message(lease));
        }

        let id = RunId(self.runs.iter().map(|r| r.id.0).max().unwrap_or(0) + 1);
        let run = SyncRun {
            id,
            status: RunStatus::Running,
            started_at: now,
            completed_at: None,
            counts: SyncCounts::default(),
            error_message: None,
        };
        self.runs.push(run.clone());
        Ok(run)
    }

    fn complete_run(
        &mut self,
        id: RunId,
        counts: SyncCounts,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        self.check(Fault::CompleteRun)?;
        self.finish_run(id, RunStatus::Completed, counts, None, now)
    }

    fn fail_run(&mut self, id: RunId, message: &str, now: DateTime<Utc>) -> Result<SyncRun, StoreError> {
        self.check(Fault::FailRun)?;
        self.finish_run(id, RunStatus::Failed, SyncCounts::default(), Some(message), now)
    }

    fn last_run(&self) -> Result<Option<SyncRun>, StoreError> {
        Ok(self.recent_runs(1)?.into_iter().next())
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let mut runs = self.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }
}
