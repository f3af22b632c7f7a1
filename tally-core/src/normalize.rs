//! Raw cell → typed value parsers.
//!
//! Every parser is total: malformed or blank input yields `None`, never an
//! error. Source data quality varies and one bad cell must not abort a row.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::headers::{CanonicalField, HeaderIndexMap};
use crate::types::TransactionFields;

/// Parse a calendar date at 12:00 UTC.
///
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD`, `DD/MM/YYYY` and `DD-MM-YYYY`. A
/// four-digit first token means year-first.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parts: Vec<&str> = raw.split(['/', '-']).map(str::trim).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let (year, month, day) = if parts[0].len() == 4 {
        (parts[0], parts[1], parts[2])
    } else {
        (parts[2], parts[1], parts[0])
    };
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;

    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(12, 0, 0)
        .map(|noon| noon.and_utc())
}

/// Parse an exact decimal after dropping everything but digits, `.` and `-`.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned = numeric_chars(raw);
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

/// Parse the integral part of a number (`"3.7"` → `3`), same stripping as
/// [`parse_decimal`].
pub fn parse_integer(raw: &str) -> Option<i64> {
    let value = parse_decimal(raw)?;
    value.trunc().to_i64()
}

/// Trimmed text, `None` when blank.
pub fn parse_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `total + vat`, or `total` alone when VAT is missing; `None` without a total
/// or when the sum does not fit in a `Decimal`.
pub fn total_with_vat(total: Option<Decimal>, vat: Option<Decimal>) -> Option<Decimal> {
    match (total, vat) {
        (Some(total), Some(vat)) => total.checked_add(vat),
        (Some(total), None) => Some(total),
        (None, _) => None,
    }
}

/// Build the typed fields for one raw row. Pure.
pub fn normalize_row(row: &[String], map: &HeaderIndexMap) -> TransactionFields {
    let text = |field| map.cell(row, field).and_then(parse_text);
    let decimal = |field| map.cell(row, field).and_then(parse_decimal);

    let total_price = decimal(CanonicalField::TotalPrice);
    let vat_amount = decimal(CanonicalField::VatAmount);

    TransactionFields {
        date: map.cell(row, CanonicalField::Date).and_then(parse_date),
        reference: text(CanonicalField::Reference),
        status: text(CanonicalField::Status),
        contact_code: text(CanonicalField::ContactCode),
        vendor: text(CanonicalField::Vendor),
        item_number: map
            .cell(row, CanonicalField::ItemNumber)
            .and_then(parse_integer),
        product_code: text(CanonicalField::ProductCode),
        product_name: text(CanonicalField::ProductName),
        account_chart: text(CanonicalField::AccountChart),
        description: text(CanonicalField::Description),
        quantity: decimal(CanonicalField::Quantity),
        unit: text(CanonicalField::Unit),
        price: decimal(CanonicalField::Price),
        discount: decimal(CanonicalField::Discount),
        total_price,
        tax_type: text(CanonicalField::TaxType),
        vat_amount,
        withholding_tax: decimal(CanonicalField::WithholdingTax),
        total_with_vat: total_with_vat(total_price, vat_amount),
        major_group: text(CanonicalField::MajorGroup),
        minor_group: text(CanonicalField::MinorGroup),
        percentage: decimal(CanonicalField::Percentage),
        payment: text(CanonicalField::Payment),
        po_number: text(CanonicalField::PoNumber),
        url: text(CanonicalField::Url),
    }
}

fn numeric_chars(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
