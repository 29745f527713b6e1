//! System-wide detector constants, threaded through stage constructors.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Number of records kept free at the end of a reader block before it is flushed.
pub const FLUSH_MARGIN: usize = 512;

/// Detector constants shared by the codec, calibration and grouping stages.
///
/// Multiple pipelines with different geometries can coexist in one process;
/// nothing here is global state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Number of readout channels. Hits with a larger channel id are discarded.
    pub n_channels: u32,
    /// Front-end clock period in picoseconds (6.25 ns at 160 MHz).
    pub clock_period_ps: i64,
    /// Capacity of the raw hit buffers produced by the reader.
    pub block_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            n_channels: 256,
            clock_period_ps: 6250,
            block_size: 128 * 1024,
        }
    }
}

impl SystemConfig {
    /// Sets the channel count.
    #[must_use]
    pub fn with_n_channels(mut self, n_channels: u32) -> Self {
        self.n_channels = n_channels;
        self
    }

    /// Sets the clock period in picoseconds.
    #[must_use]
    pub fn with_clock_period_ps(mut self, period: i64) -> Self {
        self.clock_period_ps = period;
        self
    }

    /// Sets the reader block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Duration of one frame (1024 clock cycles) in picoseconds.
    #[inline]
    #[must_use]
    pub fn frame_period_ps(&self) -> i64 {
        1024 * self.clock_period_ps
    }

    /// Number of committed records after which the reader flushes a block.
    #[must_use]
    pub fn flush_threshold(&self) -> usize {
        self.block_size.saturating_sub(FLUSH_MARGIN)
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or fails validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the JSON is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that every stage relies on.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.n_channels == 0 {
            return Err(Error::ConfigError("n_channels must be positive".into()));
        }
        if self.clock_period_ps <= 0 {
            return Err(Error::ConfigError(format!(
                "clock_period_ps must be positive, got {}",
                self.clock_period_ps
            )));
        }
        if self.block_size <= FLUSH_MARGIN {
            return Err(Error::ConfigError(format!(
                "block_size must exceed {FLUSH_MARGIN}, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}
