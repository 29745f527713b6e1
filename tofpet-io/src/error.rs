//! I/O error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// A file could not be opened or created.
    #[error("could not open '{}': {source}", path.display())]
    Open {
        /// File that failed to open.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping error.
    #[error("could not map '{}': {source}", path.display())]
    MmapError {
        /// File that failed to map.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line of a step index could not be parsed.
    #[error("invalid index line {line}: '{content}'")]
    InvalidIndex {
        /// One-based line number.
        line: usize,
        /// Offending line.
        content: String,
    },

    /// A step index or byte range outside the file.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// A buffer was written while no step was open.
    #[error("no step is open")]
    StepNotOpen,

    /// Raw codec error.
    #[error("raw codec error: {0}")]
    RawError(#[from] tofpet_raw::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] tofpet_core::Error),
}

impl Error {
    /// Returns the OS error number carried by this error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Open { source, .. } | Error::MmapError { source, .. } | Error::Io(source) => {
                source.raw_os_error()
            }
            Error::CoreError(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Converts into the error type carried through sink chains.
    pub(crate) fn into_sink_error(self, stage: &'static str) -> tofpet_core::Error {
        match self {
            Error::Io(e) => tofpet_core::Error::Io(e),
            Error::CoreError(e) => e,
            other => tofpet_core::Error::Sink {
                stage,
                message: other.to_string(),
            },
        }
    }
}
