//! Raw codec error types.

use thiserror::Error;

/// Result type for raw codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Raw codec error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Type byte outside the known record codes.
    #[error("unknown record type {code} at byte {offset}")]
    UnknownRecordType {
        /// Offending type byte.
        code: u8,
        /// Byte offset of the record.
        offset: usize,
    },

    /// Fewer bytes left than the record type requires.
    #[error("truncated record of type {code} at byte {offset}: need {needed} bytes, have {available}")]
    Truncated {
        /// Record type byte.
        code: u8,
        /// Byte offset of the record.
        offset: usize,
        /// Encoded size of the record type.
        needed: usize,
        /// Bytes left in the input.
        available: usize,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] tofpet_core::Error),
}
