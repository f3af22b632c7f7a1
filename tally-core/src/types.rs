//! Domain types for the Tally transaction table and run ledger.
//!
//! Monetary amounts and quantities are [`Decimal`]; never `f64`.
//! All types are serializable via serde; JSON field names are camelCase.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Natural key of a transaction: its 1-based spreadsheet row.
///
/// Row 1 is the header, so the first data row is row 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowNumber(pub i64);

impl RowNumber {
    /// Row number for the data row at zero-based `position` below the header.
    pub fn from_position(position: usize) -> Self {
        Self(position as i64 + 2)
    }
}

impl fmt::Display for RowNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for RowNumber {
    fn from(n: i64) -> Self {
        Self(n)
    }
}

/// Identifier of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for RunId {
    fn from(n: i64) -> Self {
        Self(n)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a sync run. `Running` transitions exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The four counters reported by a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub total_rows: usize,
    pub inserted_rows: usize,
    pub updated_rows: usize,
    pub deleted_rows: usize,
}

impl SyncCounts {
    /// True when the run changed nothing in the transaction table.
    pub fn is_noop(&self) -> bool {
        self.inserted_rows == 0 && self.updated_rows == 0 && self.deleted_rows == 0
    }
}

/// One entry of the run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Typed business fields of one spreadsheet row. Every field is nullable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransactionFields {
    pub date: Option<DateTime<Utc>>,
    pub reference: Option<String>,
    pub status: Option<String>,
    pub contact_code: Option<String>,
    pub vendor: Option<String>,
    pub item_number: Option<i64>,
    pub product_code: Option<String>,
    pub product_name: Option<String>,
    pub account_chart: Option<String>,
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit: Option<String>,
    pub price: Option<Decimal>,
    pub discount: Option<Decimal>,
    pub total_price: Option<Decimal>,
    pub tax_type: Option<String>,
    pub vat_amount: Option<Decimal>,
    pub withholding_tax: Option<Decimal>,
    /// `total_price + vat_amount`; derived, never read from the sheet.
    pub total_with_vat: Option<Decimal>,
    pub major_group: Option<String>,
    pub minor_group: Option<String>,
    pub percentage: Option<Decimal>,
    pub payment: Option<String>,
    pub po_number: Option<String>,
    pub url: Option<String>,
}

/// A persisted transaction row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub row_number: RowNumber,
    #[serde(flatten)]
    pub fields: TransactionFields,
    /// Fingerprint of the raw cells that produced `fields`.
    pub row_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
