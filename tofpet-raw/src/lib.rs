//! tofpet-raw: Raw record codec for TOFPET/STIC acquisition streams.
//!
//! This crate provides:
//! - The packed little-endian record layout (start time, frame header,
//!   TOFPET and STIC hits)
//! - Frame and coarse counter to picosecond conversion
//! - A stateful decoder producing [`tofpet_core::RawHit`]s
//! - An encoder that inserts frame headers as frames advance
//!

pub mod decoder;
pub mod encoder;
mod error;
pub mod record;
pub mod timing;

pub use decoder::{DecodeOutcome, DecoderStats, FrameDecoder};
pub use encoder::FrameEncoder;
pub use error::{Error, Result};
pub use record::{FrameHeader, Record, RecordType, SticRecord, StartTime, TofpetRecord};
