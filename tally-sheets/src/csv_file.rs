//! Local CSV export adapter.
//!
//! Reads the whole file on every fetch. Rows may be ragged; the first record
//! is the header row.

use std::path::{Path, PathBuf};

use crate::{SheetData, SheetSource, SourceError};

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SheetSource for CsvFileSource {
    fn fetch(&self) -> Result<SheetData, SourceError> {
        let csv_err = |source| SourceError::Csv {
            path: self.path.clone(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(&self.path)
            .map_err(csv_err)?;

        let mut values = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            values.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        // Spreadsheet exports often start with a BOM.
        if let Some(first) = values.first_mut().and_then(|row| row.first_mut()) {
            if first.starts_with(UTF8_BOM) {
                *first = first.trim_start_matches(UTF8_BOM).to_string();
            }
        }

        tracing::debug!(path = %self.path.display(), rows = values.len(), "read csv export");
        Ok(SheetData::from_values(values))
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}
