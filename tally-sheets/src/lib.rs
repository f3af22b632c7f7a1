//! # tally-sheets
//!
//! Sheet source adapters. A source returns the header row and every data row
//! as plain strings; it knows nothing about transactions.
//!
//! Call [`from_config`] to build the adapter named in `config.yaml`.

pub mod csv_file;
pub mod error;
pub mod google;

use std::time::Duration;

use tally_core::SourceConfig;

pub use csv_file::CsvFileSource;
pub use error::SourceError;
pub use google::{Credential, GoogleSheetsSource};

/// Header row plus data rows, in sheet order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SheetData {
    /// Split a full value grid into header row and data rows.
    pub fn from_values(mut values: Vec<Vec<String>>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let rows = values.split_off(1);
        let headers = values.pop().unwrap_or_default();
        Self { headers, rows }
    }

    /// True when the source returned nothing at all, not even a header row.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.rows.is_empty()
    }
}

/// A pluggable tabular data source.
pub trait SheetSource {
    /// Fetch the header row and all data rows.
    fn fetch(&self) -> Result<SheetData, SourceError>;

    /// Short human-readable identity for logs.
    fn describe(&self) -> String;
}

impl<T: SheetSource + ?Sized> SheetSource for Box<T> {
    fn fetch(&self) -> Result<SheetData, SourceError> {
        (**self).fetch()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Build the source adapter described by `config`.
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn SheetSource + Send>, SourceError> {
    match config {
        SourceConfig::GoogleSheets {
            spreadsheet_id,
            range,
            access_token_env,
            api_key_env,
            timeout_secs,
        } => {
            let source = GoogleSheetsSource::from_env(
                spreadsheet_id,
                range,
                access_token_env.as_deref(),
                api_key_env.as_deref(),
                Duration::from_secs(*timeout_secs),
            )?;
            Ok(Box::new(source))
        }
        SourceConfig::Csv { path } => Ok(Box::new(CsvFileSource::new(path.clone()))),
    }
}
