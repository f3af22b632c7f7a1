//! SQLite backend.
//!
//! Decimals are stored as their exact text form. Timestamps are RFC 3339 UTC
//! with fixed microsecond width so text ordering matches time ordering.
//! Schema changes are applied in order and tracked in `PRAGMA user_version`.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;

use tally_core::{
    RowNumber, RunId, RunStatus, SyncCounts, SyncRun, TransactionFields, TransactionRecord,
};

use super::{abandoned_message, holds_lease, ChangeKind, RowChange, RunLedger, StoreError, TransactionStore};

pub const SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Row numbers bound per `DELETE … IN (…)`; well under SQLite's variable limit.
const DELETE_CHUNK: usize = 500;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS transactions (
    row_number      INTEGER PRIMARY KEY,
    date            TEXT,
    reference       TEXT,
    status          TEXT,
    contact_code    TEXT,
    vendor          TEXT,
    item_number     INTEGER,
    product_code    TEXT,
    product_name    TEXT,
    account_chart   TEXT,
    description     TEXT,
    quantity        TEXT,
    unit            TEXT,
    price           TEXT,
    discount        TEXT,
    total_price     TEXT,
    tax_type        TEXT,
    vat_amount      TEXT,
    withholding_tax TEXT,
    total_with_vat  TEXT,
    major_group     TEXT,
    minor_group     TEXT,
    percentage      TEXT,
    payment         TEXT,
    po_number       TEXT,
    url             TEXT,
    row_hash        TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    status        TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    started_at    TEXT NOT NULL,
    completed_at  TEXT,
    total_rows    INTEGER NOT NULL DEFAULT 0,
    inserted_rows INTEGER NOT NULL DEFAULT 0,
    updated_rows  INTEGER NOT NULL DEFAULT 0,
    deleted_rows  INTEGER NOT NULL DEFAULT 0,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS sync_runs_started_at ON sync_runs (started_at);
CREATE INDEX IF NOT EXISTS sync_runs_status ON sync_runs (status);
";

/// Index `i` holds the statements that move the schema to version `i + 1`.
const MIGRATIONS: &[&str] = &[SCHEMA_V1];

const FIELD_COLUMNS: [&str; 25] = [
    "date",
    "reference",
    "status",
    "contact_code",
    "vendor",
    "item_number",
    "product_code",
    "product_name",
    "account_chart",
    "description",
    "quantity",
    "unit",
    "price",
    "discount",
    "total_price",
    "tax_type",
    "vat_amount",
    "withholding_tax",
    "total_with_vat",
    "major_group",
    "minor_group",
    "percentage",
    "payment",
    "po_number",
    "url",
];

const RUN_COLUMNS: &str = "id, status, started_at, completed_at, total_rows, inserted_rows, \
                           updated_rows, deleted_rows, error_message";

pub struct SqliteStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and bring its schema
    /// up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn finish_run(
        &mut self,
        id: RunId,
        status: RunStatus,
        counts: SyncCounts,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch_run(&tx, id)?.ok_or(StoreError::RunNotFound(id))?;
        if current.status.is_terminal() {
            return Err(StoreError::RunNotRunning {
                id,
                status: current.status,
            });
        }

        tx.execute(
            "UPDATE sync_runs
                SET status = ?2, completed_at = ?3, total_rows = ?4, inserted_rows = ?5,
                    updated_rows = ?6, deleted_rows = ?7, error_message = ?8
              WHERE id = ?1",
            params![
                id.0,
                status.as_str(),
                timestamp(&now),
                count_value(counts.total_rows),
                count_value(counts.inserted_rows),
                count_value(counts.updated_rows),
                count_value(counts.deleted_rows),
                message,
            ],
        )?;
        let run = fetch_run(&tx, id)?.ok_or(StoreError::RunNotFound(id))?;
        tx.commit()?;
        Ok(run)
    }
}

impl TransactionStore for SqliteStore {
    fn load_baseline(&self) -> Result<HashMap<RowNumber, String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT row_number, row_hash FROM transactions")?;
        let rows = stmt.query_map([], |row| Ok((RowNumber(row.get(0)?), row.get::<_, String>(1)?)))?;
        let mut baseline = HashMap::new();
        for entry in rows {
            let (row_number, hash) = entry?;
            baseline.insert(row_number, hash);
        }
        Ok(baseline)
    }

    fn apply_changes(&mut self, changes: &[RowChange], now: DateTime<Utc>) -> Result<(), StoreError> {
        if changes.is_empty() {
            return Ok(());
        }
        let now = timestamp(&now);
        let insert_sql = insert_sql();
        let update_sql = update_sql();

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(&insert_sql)?;
            let mut update = tx.prepare_cached(&update_sql)?;
            for change in changes {
                let mut values = Vec::with_capacity(FIELD_COLUMNS.len() + 4);
                values.push(Value::Integer(change.row_number.0));
                values.extend(field_values(&change.fields));
                values.push(Value::Text(change.row_hash.clone()));
                values.push(Value::Text(now.clone()));
                match change.kind {
                    ChangeKind::Insert => {
                        values.push(Value::Text(now.clone()));
                        insert
                            .execute(params_from_iter(values.iter()))
                            .map_err(|err| insert_error(err, change.row_number))?;
                    }
                    ChangeKind::Update => {
                        if update.execute(params_from_iter(values.iter()))? == 0 {
                            return Err(StoreError::MissingRow(change.row_number));
                        }
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete_rows(&mut self, rows: &[RowNumber]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut deleted = 0;
        for chunk in rows.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            deleted += tx.execute(
                &format!("DELETE FROM transactions WHERE row_number IN ({placeholders})"),
                params_from_iter(chunk.iter().map(|row| row.0)),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn list_transactions(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let sql = format!(
            "SELECT row_number, {}, row_hash, created_at, updated_at
               FROM transactions ORDER BY row_number",
            FIELD_COLUMNS.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(from_sqlite)?;
        Ok(records)
    }
}

impl RunLedger for SqliteStore {
    fn create_run(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<SyncRun, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let running: Vec<SyncRun> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM sync_runs WHERE status = 'running' ORDER BY id"
            ))?;
            let rows = stmt.query_map([], run_from_row)?;
            rows.collect::<Result<_, _>>().map_err(from_sqlite)?
        };

        for run in &running {
            if holds_lease(run.started_at, now, lease) {
                return Err(StoreError::RunInProgress {
                    id: run.id,
                    started_at: run.started_at,
                });
            }
        }
        for run in &running {
            tracing::warn!(run_id = %run.id, started_at = %run.started_at, "failing abandoned sync run");
            tx.execute(
                "UPDATE sync_runs SET status = 'failed', completed_at = ?2, error_message = ?3
                  WHERE id = ?1",
                params![run.id.0, timestamp(&now), abandoned_message(lease)],
            )?;
        }

        tx.execute(
            "INSERT INTO sync_runs (status, started_at) VALUES ('running', ?1)",
            params![timestamp(&now)],
        )?;
        let id = RunId(tx.last_insert_rowid());
        let run = fetch_run(&tx, id)?.ok_or(StoreError::RunNotFound(id))?;
        tx.commit()?;
        Ok(run)
    }

    fn complete_run(
        &mut self,
        id: RunId,
        counts: SyncCounts,
        now: DateTime<Utc>,
    ) -> Result<SyncRun, StoreError> {
        self.finish_run(id, RunStatus::Completed, counts, None, now)
    }

    fn fail_run(&mut self, id: RunId, message: &str, now: DateTime<Utc>) -> Result<SyncRun, StoreError> {
        self.finish_run(id, RunStatus::Failed, SyncCounts::default(), Some(message), now)
    }

    fn last_run(&self) -> Result<Option<SyncRun>, StoreError> {
        Ok(self.recent_runs(1)?.into_iter().next())
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC, id DESC LIMIT ?1"
        ))?;
        let runs = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(from_sqlite)?;
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    if supported_version(conn)? == SCHEMA_VERSION {
        return Ok(());
    }
    // Re-read under the write lock so two processes opening a fresh file
    // cannot both migrate.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let version = supported_version(&tx)?;
    for (idx, sql) in MIGRATIONS.iter().enumerate().skip(version.max(0) as usize) {
        tx.execute_batch(sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", idx + 1))?;
        tracing::debug!(version = idx + 1, "applied schema migration");
    }
    tx.commit()?;
    Ok(())
}

fn supported_version(conn: &Connection) -> Result<i64, StoreError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Corrupt(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }
    Ok(version)
}

fn insert_sql() -> String {
    let placeholders: Vec<String> = (1..=FIELD_COLUMNS.len() + 4).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO transactions (row_number, {}, row_hash, updated_at, created_at) VALUES ({})",
        FIELD_COLUMNS.join(", "),
        placeholders.join(", ")
    )
}

fn update_sql() -> String {
    let n = FIELD_COLUMNS.len();
    let assignments: Vec<String> = FIELD_COLUMNS
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ?{}", i + 2))
        .collect();
    format!(
        "UPDATE transactions SET {}, row_hash = ?{}, updated_at = ?{} WHERE row_number = ?1",
        assignments.join(", "),
        n + 2,
        n + 3
    )
}

// ---------------------------------------------------------------------------
// Value mapping
// ---------------------------------------------------------------------------

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn count_value(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn text(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.clone()))
}

fn decimal(value: Option<Decimal>) -> Value {
    value.map_or(Value::Null, |d| Value::Text(d.to_string()))
}

/// Bind order matches [`FIELD_COLUMNS`].
fn field_values(f: &TransactionFields) -> Vec<Value> {
    vec![
        f.date.as_ref().map_or(Value::Null, |d| Value::Text(timestamp(d))),
        text(f.reference.as_ref()),
        text(f.status.as_ref()),
        text(f.contact_code.as_ref()),
        text(f.vendor.as_ref()),
        f.item_number.map_or(Value::Null, Value::Integer),
        text(f.product_code.as_ref()),
        text(f.product_name.as_ref()),
        text(f.account_chart.as_ref()),
        text(f.description.as_ref()),
        decimal(f.quantity),
        text(f.unit.as_ref()),
        decimal(f.price),
        decimal(f.discount),
        decimal(f.total_price),
        text(f.tax_type.as_ref()),
        decimal(f.vat_amount),
        decimal(f.withholding_tax),
        decimal(f.total_with_vat),
        text(f.major_group.as_ref()),
        text(f.minor_group.as_ref()),
        decimal(f.percentage),
        text(f.payment.as_ref()),
        text(f.po_number.as_ref()),
        text(f.url.as_ref()),
    ]
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => timestamp_col(row, idx).map(Some),
    }
}

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn count_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<usize> {
    let raw: i64 = row.get(idx)?;
    usize::try_from(raw).map_err(|e| conversion_error(idx, e))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        row_number: RowNumber(row.get(0)?),
        fields: TransactionFields {
            date: opt_timestamp_col(row, 1)?,
            reference: row.get(2)?,
            status: row.get(3)?,
            contact_code: row.get(4)?,
            vendor: row.get(5)?,
            item_number: row.get(6)?,
            product_code: row.get(7)?,
            product_name: row.get(8)?,
            account_chart: row.get(9)?,
            description: row.get(10)?,
            quantity: decimal_col(row, 11)?,
            unit: row.get(12)?,
            price: decimal_col(row, 13)?,
            discount: decimal_col(row, 14)?,
            total_price: decimal_col(row, 15)?,
            tax_type: row.get(16)?,
            vat_amount: decimal_col(row, 17)?,
            withholding_tax: decimal_col(row, 18)?,
            total_with_vat: decimal_col(row, 19)?,
            major_group: row.get(20)?,
            minor_group: row.get(21)?,
            percentage: decimal_col(row, 22)?,
            payment: row.get(23)?,
            po_number: row.get(24)?,
            url: row.get(25)?,
        },
        row_hash: row.get(26)?,
        created_at: timestamp_col(row, 27)?,
        updated_at: timestamp_col(row, 28)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let status: String = row.get(1)?;
    Ok(SyncRun {
        id: RunId(row.get(0)?),
        status: status.parse().map_err(|e: String| conversion_error(1, e))?,
        started_at: timestamp_col(row, 2)?,
        completed_at: opt_timestamp_col(row, 3)?,
        counts: SyncCounts {
            total_rows: count_col(row, 4)?,
            inserted_rows: count_col(row, 5)?,
            updated_rows: count_col(row, 6)?,
            deleted_rows: count_col(row, 7)?,
        },
        error_message: row.get(8)?,
    })
}

fn fetch_run(conn: &Connection, id: RunId) -> Result<Option<SyncRun>, StoreError> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?1"),
        params![id.0],
        run_from_row,
    )
    .optional()
    .map_err(from_sqlite)
}

/// Conversion failures mean the stored text is not what this crate wrote.
fn insert_error(err: rusqlite::Error, row: RowNumber) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::DuplicateRow(row)
        }
        other => StoreError::Sqlite(other),
    }
}

fn from_sqlite(err: rusqlite::Error) -> StoreError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(idx, _, source) => {
            StoreError::Corrupt(format!("column {idx}: {source}"))
        }
        other => StoreError::Sqlite(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
