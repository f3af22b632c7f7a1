//! Header translation: source-language header text → canonical field → column.
//!
//! The [`HeaderTable`] is configuration (canonical field → recognised header
//! texts). A [`HeaderIndexMap`] is built from it once per run against the live
//! header row. A canonical field whose header is missing from the sheet is
//! simply absent from the map; every row then reads it as null.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Canonical fields
// ---------------------------------------------------------------------------

/// Sheet-backed fields of a transaction. `totalWithVat` is derived and has no
/// column of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanonicalField {
    Date,
    Reference,
    Status,
    ContactCode,
    Vendor,
    ItemNumber,
    ProductCode,
    ProductName,
    AccountChart,
    Description,
    Quantity,
    Unit,
    Price,
    Discount,
    TotalPrice,
    TaxType,
    VatAmount,
    WithholdingTax,
    MajorGroup,
    MinorGroup,
    Percentage,
    Payment,
    PoNumber,
    Url,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 24] = [
        CanonicalField::Date,
        CanonicalField::Reference,
        CanonicalField::Status,
        CanonicalField::ContactCode,
        CanonicalField::Vendor,
        CanonicalField::ItemNumber,
        CanonicalField::ProductCode,
        CanonicalField::ProductName,
        CanonicalField::AccountChart,
        CanonicalField::Description,
        CanonicalField::Quantity,
        CanonicalField::Unit,
        CanonicalField::Price,
        CanonicalField::Discount,
        CanonicalField::TotalPrice,
        CanonicalField::TaxType,
        CanonicalField::VatAmount,
        CanonicalField::WithholdingTax,
        CanonicalField::MajorGroup,
        CanonicalField::MinorGroup,
        CanonicalField::Percentage,
        CanonicalField::Payment,
        CanonicalField::PoNumber,
        CanonicalField::Url,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalField::Date => "date",
            CanonicalField::Reference => "reference",
            CanonicalField::Status => "status",
            CanonicalField::ContactCode => "contactCode",
            CanonicalField::Vendor => "vendor",
            CanonicalField::ItemNumber => "itemNumber",
            CanonicalField::ProductCode => "productCode",
            CanonicalField::ProductName => "productName",
            CanonicalField::AccountChart => "accountChart",
            CanonicalField::Description => "description",
            CanonicalField::Quantity => "quantity",
            CanonicalField::Unit => "unit",
            CanonicalField::Price => "price",
            CanonicalField::Discount => "discount",
            CanonicalField::TotalPrice => "totalPrice",
            CanonicalField::TaxType => "taxType",
            CanonicalField::VatAmount => "vatAmount",
            CanonicalField::WithholdingTax => "withholdingTax",
            CanonicalField::MajorGroup => "majorGroup",
            CanonicalField::MinorGroup => "minorGroup",
            CanonicalField::Percentage => "percentage",
            CanonicalField::Payment => "payment",
            CanonicalField::PoNumber => "poNumber",
            CanonicalField::Url => "url",
        }
    }

    /// Header texts recognised when the config does not override the field.
    fn default_headers(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::Date => &["วันที่", "Date"],
            CanonicalField::Reference => &["เลขที่เอกสาร", "เลขที่อ้างอิง", "Reference"],
            CanonicalField::Status => &["สถานะ", "Status"],
            CanonicalField::ContactCode => &["รหัสผู้ติดต่อ", "Contact Code"],
            CanonicalField::Vendor => &["ผู้ขาย", "ชื่อผู้ติดต่อ", "Vendor"],
            CanonicalField::ItemNumber => &["ลำดับ", "Item No", "Item Number"],
            CanonicalField::ProductCode => &["รหัสสินค้า", "Product Code"],
            CanonicalField::ProductName => &["ชื่อสินค้า", "Product Name"],
            CanonicalField::AccountChart => &["ผังบัญชี", "Account Chart"],
            CanonicalField::Description => &["รายละเอียด", "คำอธิบาย", "Description"],
            CanonicalField::Quantity => &["จำนวน", "Quantity"],
            CanonicalField::Unit => &["หน่วย", "Unit"],
            CanonicalField::Price => &["ราคาต่อหน่วย", "Price"],
            CanonicalField::Discount => &["ส่วนลด", "Discount"],
            CanonicalField::TotalPrice => &["ราคารวม", "มูลค่ารวม", "Total Price"],
            CanonicalField::TaxType => &["ประเภทภาษี", "Tax Type"],
            CanonicalField::VatAmount => &["ภาษีมูลค่าเพิ่ม", "VAT", "VAT Amount"],
            CanonicalField::WithholdingTax => &["ภาษีหัก ณ ที่จ่าย", "Withholding Tax"],
            CanonicalField::MajorGroup => &["กลุ่มหลัก", "Major Group"],
            CanonicalField::MinorGroup => &["กลุ่มย่อย", "Minor Group"],
            CanonicalField::Percentage => &["เปอร์เซ็นต์", "%", "Percentage"],
            CanonicalField::Payment => &["การชำระเงิน", "Payment"],
            CanonicalField::PoNumber => &["เลขที่ PO", "PO Number", "PO"],
            CanonicalField::Url => &["ลิงก์", "URL", "Link"],
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HeaderTable
// ---------------------------------------------------------------------------

/// Canonical field → recognised header texts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderTable(pub BTreeMap<CanonicalField, Vec<String>>);

impl Default for HeaderTable {
    fn default() -> Self {
        Self(
            CanonicalField::ALL
                .iter()
                .map(|field| {
                    let texts = field
                        .default_headers()
                        .iter()
                        .map(|text| (*text).to_string())
                        .collect();
                    (*field, texts)
                })
                .collect(),
        )
    }
}

impl HeaderTable {
    /// Default table with each field in `overrides` replaced wholesale.
    pub fn with_overrides(overrides: &BTreeMap<CanonicalField, Vec<String>>) -> Self {
        let mut table = Self::default();
        for (field, texts) in overrides {
            table.0.insert(*field, texts.clone());
        }
        table
    }

    pub fn texts(&self, field: CanonicalField) -> &[String] {
        self.0.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// HeaderIndexMap
// ---------------------------------------------------------------------------

/// Canonical field → column position in the current header row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderIndexMap {
    columns: BTreeMap<CanonicalField, usize>,
}

impl HeaderIndexMap {
    /// Match every canonical field against `headers`.
    ///
    /// Comparison is on trimmed text, case-insensitive. When several columns
    /// match a field, the leftmost wins. Unmatched fields are left out.
    pub fn build(headers: &[String], table: &HeaderTable) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| fold(h)).collect();
        let mut columns = BTreeMap::new();

        for field in CanonicalField::ALL {
            let wanted: Vec<String> = table.texts(field).iter().map(|t| fold(t)).collect();
            if let Some(position) = normalized
                .iter()
                .position(|header| !header.is_empty() && wanted.contains(header))
            {
                columns.insert(field, position);
            }
        }

        Self { columns }
    }

    pub fn position(&self, field: CanonicalField) -> Option<usize> {
        self.columns.get(&field).copied()
    }

    /// The raw cell for `field` in `row`, if the column exists and the row is
    /// wide enough to reach it.
    pub fn cell<'a>(&self, row: &'a [String], field: CanonicalField) -> Option<&'a str> {
        self.position(field)
            .and_then(|idx| row.get(idx))
            .map(String::as_str)
    }

    /// Fields whose header was not found in this run.
    pub fn missing(&self) -> Vec<CanonicalField> {
        CanonicalField::ALL
            .into_iter()
            .filter(|field| !self.columns.contains_key(field))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn fold(text: &str) -> String {
    text.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
