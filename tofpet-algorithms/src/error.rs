//! Error types for the processing stages.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for stage construction and table loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Stage construction and table loading errors.
#[derive(Error, Debug)]
pub enum Error {
    /// A table or geometry file could not be opened.
    #[error("could not open '{}': {source}", path.display())]
    Open {
        /// File that failed to open.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Malformed JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A table entry is inconsistent.
    #[error("invalid calibration table: {0}")]
    InvalidTable(String),

    /// A stage parameter is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] tofpet_core::Error),
}

impl Error {
    /// Returns the OS error number carried by this error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. } => source.raw_os_error(),
            Error::CoreError(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
