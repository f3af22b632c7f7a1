//! Error types for tally-sheets.

use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong reaching a sheet source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The API answered with a non-success status.
    #[error("sheets API returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection, DNS, TLS or timeout failure.
    #[error("sheets API transport error: {0}")]
    Transport(String),

    /// The response body was not the expected JSON.
    #[error("sheets API response could not be decoded: {0}")]
    Decode(String),

    /// None of the configured credential env vars is set.
    #[error("no sheets credential found; set one of: {0}")]
    MissingCredential(String),

    /// The source configuration is unusable.
    #[error("invalid source config: {0}")]
    InvalidConfig(String),

    /// The CSV export could not be read or parsed.
    #[error("CSV error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}
