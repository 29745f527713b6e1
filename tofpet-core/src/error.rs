//! Error types for tofpet-core.

use thiserror::Error;

/// Result type alias for tofpet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types shared by every pipeline stage.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Failed to parse a JSON configuration.
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error raised while loading configuration or writing output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A downstream sink refused a buffer.
    #[error("sink error in {stage}: {message}")]
    Sink {
        /// Stage that raised the error.
        stage: &'static str,
        /// Human readable cause.
        message: String,
    },

    /// The producer thread panicked before calling `finish()`.
    #[error("source thread '{0}' panicked")]
    SourcePanicked(String),

    /// The producer thread could not be started.
    #[error("failed to spawn source thread '{name}': {source}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Returns the OS error number carried by this error, if any.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) | Error::Spawn { source: e, .. } => e.raw_os_error(),
            _ => None,
        }
    }
}
