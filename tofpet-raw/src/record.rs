//! On-disk record layout.
//!
//! Every record starts with a one byte type code and has a fixed,
//! little-endian, packed layout determined by that code.

use crate::{Error, Result};
use std::io::Write;
use tofpet_core::{RawData, RawHit};

/// Record type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// Acquisition start time.
    StartTime = 0,
    /// Start of a new frame.
    FrameHeader = 1,
    /// TOFPET hit.
    Tofpet = 2,
    /// STIC hit.
    Stic = 3,
}

impl RecordType {
    /// Maps a type byte to a record type.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RecordType::StartTime),
            1 => Some(RecordType::FrameHeader),
            2 => Some(RecordType::Tofpet),
            3 => Some(RecordType::Stic),
            _ => None,
        }
    }

    /// The type byte.
    #[inline]
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Encoded size of records of this type, type byte included.
    #[inline]
    #[must_use]
    pub fn encoded_len(self) -> usize {
        match self {
            RecordType::StartTime => StartTime::SIZE,
            RecordType::FrameHeader => FrameHeader::SIZE,
            RecordType::Tofpet => TofpetRecord::SIZE,
            RecordType::Stic => SticRecord::SIZE,
        }
    }
}

/// Type 0: acquisition start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartTime {
    pub time: i64,
}

impl StartTime {
    pub const SIZE: usize = 9;
}

/// Type 1: frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub frame_id: u64,
    /// Clock drift estimate. Written as zero.
    pub drift: i64,
}

impl FrameHeader {
    pub const SIZE: usize = 17;
}

/// Type 2: TOFPET hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TofpetRecord {
    pub tac: u8,
    pub channel_id: u32,
    pub t_coarse: u16,
    pub e_coarse: u16,
    pub t_fine: u16,
    pub e_fine: u16,
    pub tac_idle_time: i64,
    pub channel_idle_time: i64,
}

impl TofpetRecord {
    pub const SIZE: usize = 30;
}

/// Type 3: STIC hit. Coarse counters are stored before LFSR compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SticRecord {
    pub channel_id: u32,
    pub t_coarse: u16,
    pub e_coarse: u16,
    pub t_fine: u16,
    pub e_fine: u16,
    pub t_bad_hit: bool,
    pub e_bad_hit: bool,
    pub channel_idle_time: i64,
}

impl SticRecord {
    pub const SIZE: usize = 23;
}

/// Any record of the raw stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    StartTime(StartTime),
    FrameHeader(FrameHeader),
    Tofpet(TofpetRecord),
    Stic(SticRecord),
}

impl Record {
    /// Type of this record.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::StartTime(_) => RecordType::StartTime,
            Record::FrameHeader(_) => RecordType::FrameHeader,
            Record::Tofpet(_) => RecordType::Tofpet,
            Record::Stic(_) => RecordType::Stic,
        }
    }

    /// Encoded size, type byte included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.record_type().encoded_len()
    }

    /// Builds the hit record that stores `hit`.
    #[must_use]
    pub fn from_raw_hit(hit: &RawHit) -> Self {
        match hit.data {
            RawData::Tofpet {
                tac,
                t_coarse,
                e_coarse,
                t_fine,
                e_fine,
                tac_idle_time,
            } => Record::Tofpet(TofpetRecord {
                tac,
                channel_id: hit.channel_id,
                t_coarse,
                e_coarse,
                t_fine,
                e_fine,
                tac_idle_time,
                channel_idle_time: hit.channel_idle_time,
            }),
            RawData::Stic {
                t_coarse,
                e_coarse,
                t_fine,
                e_fine,
                t_bad_hit,
                e_bad_hit,
            } => Record::Stic(SticRecord {
                channel_id: hit.channel_id,
                t_coarse,
                e_coarse,
                t_fine,
                e_fine,
                t_bad_hit,
                e_bad_hit,
                channel_idle_time: hit.channel_idle_time,
            }),
        }
    }

    /// Decodes the record starting at `bytes[0]`.
    ///
    /// `offset` is only used to locate the record in error messages.
    ///
    /// # Errors
    /// Returns [`Error::UnknownRecordType`] for an unknown type byte and
    /// [`Error::Truncated`] if `bytes` is shorter than the record.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Self> {
        let Some(&code) = bytes.first() else {
            return Err(Error::Truncated {
                code: 0,
                offset,
                needed: 1,
                available: 0,
            });
        };
        let record_type =
            RecordType::from_code(code).ok_or(Error::UnknownRecordType { code, offset })?;
        let needed = record_type.encoded_len();
        if bytes.len() < needed {
            return Err(Error::Truncated {
                code,
                offset,
                needed,
                available: bytes.len(),
            });
        }

        let mut r = LeReader::new(&bytes[1..needed]);
        let record = match record_type {
            RecordType::StartTime => Record::StartTime(StartTime { time: r.i64() }),
            RecordType::FrameHeader => Record::FrameHeader(FrameHeader {
                frame_id: r.u64(),
                drift: r.i64(),
            }),
            RecordType::Tofpet => Record::Tofpet(TofpetRecord {
                tac: r.u8(),
                channel_id: r.u32(),
                t_coarse: r.u16(),
                e_coarse: r.u16(),
                t_fine: r.u16(),
                e_fine: r.u16(),
                tac_idle_time: r.i64(),
                channel_idle_time: r.i64(),
            }),
            RecordType::Stic => Record::Stic(SticRecord {
                channel_id: r.u32(),
                t_coarse: r.u16(),
                e_coarse: r.u16(),
                t_fine: r.u16(),
                e_fine: r.u16(),
                t_bad_hit: r.u8() != 0,
                e_bad_hit: r.u8() != 0,
                channel_idle_time: r.i64(),
            }),
        };
        Ok(record)
    }

    /// Writes the encoded record.
    ///
    /// # Errors
    /// Returns any error raised by the writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        let mut buf = [0u8; TofpetRecord::SIZE];
        let len = self.encode_into(&mut buf);
        writer.write_all(&buf[..len])?;
        Ok(len)
    }

    /// Appends the encoded record to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut buf = [0u8; TofpetRecord::SIZE];
        let len = self.encode_into(&mut buf);
        out.extend_from_slice(&buf[..len]);
    }

    fn encode_into(&self, buf: &mut [u8; TofpetRecord::SIZE]) -> usize {
        let mut w = LeWriter::new(buf);
        w.u8(self.record_type().code());
        match self {
            Record::StartTime(r) => w.i64(r.time),
            Record::FrameHeader(r) => {
                w.u64(r.frame_id);
                w.i64(r.drift);
            }
            Record::Tofpet(r) => {
                w.u8(r.tac);
                w.u32(r.channel_id);
                w.u16(r.t_coarse);
                w.u16(r.e_coarse);
                w.u16(r.t_fine);
                w.u16(r.e_fine);
                w.i64(r.tac_idle_time);
                w.i64(r.channel_idle_time);
            }
            Record::Stic(r) => {
                w.u32(r.channel_id);
                w.u16(r.t_coarse);
                w.u16(r.e_coarse);
                w.u16(r.t_fine);
                w.u16(r.e_fine);
                w.u8(u8::from(r.t_bad_hit));
                w.u8(u8::from(r.e_bad_hit));
                w.i64(r.channel_idle_time);
            }
        }
        w.pos
    }
}

/// Little-endian field reader over a slice whose length was checked up front.
struct LeReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> LeReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.take())
    }
}

struct LeWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> LeWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }
}
