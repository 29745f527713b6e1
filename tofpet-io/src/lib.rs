//! tofpet-io: File I/O for tofpet.
//!
//! This crate provides the memory-mapped raw file reader that sources a
//! processing chain, the raw writer with its step index, the index scanner,
//! and writers for calibrated singles and grouped photons.
//!

mod error;
mod reader;
pub mod scanner;
mod writer;

pub use error::{Error, Result};
pub use reader::{MappedFileReader, RawReader, ReaderStatistics};
pub use scanner::{RawScanner, Step};
pub use writer::{
    index_path, raw_path, PhotonFormat, PhotonWriter, RawWriter, RawWriterSink, SinglesWriter,
    INDEX_EXTENSION, PHOTON_CSV_HEADER, PHOTON_RECORD_SIZE, RAW_EXTENSION, SINGLES_RECORD_SIZE,
};
