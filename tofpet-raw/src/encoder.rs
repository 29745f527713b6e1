//! Raw stream encoder.

use crate::record::{FrameHeader, Record, StartTime};
use crate::timing::frame_id_of;
use std::io::{self, Write};
use tofpet_core::RawHit;

/// Writes hits as raw records, inserting frame headers as frames advance.
///
/// Tracks the number of bytes written so callers can index the output.
#[derive(Debug)]
pub struct FrameEncoder<W: Write> {
    writer: W,
    clock_period_ps: i64,
    current_frame_id: Option<u64>,
    position: u64,
}

impl<W: Write> FrameEncoder<W> {
    /// Wraps `writer`. No header is written yet.
    pub fn new(writer: W, clock_period_ps: i64) -> Self {
        Self {
            writer,
            clock_period_ps,
            current_frame_id: None,
            position: 0,
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Forces a frame header before the next hit.
    pub fn reset_frame(&mut self) {
        self.current_frame_id = None;
    }

    /// Writes a start-time record.
    ///
    /// # Errors
    /// Returns any error raised by the writer.
    pub fn write_start_time(&mut self, time: i64) -> io::Result<()> {
        self.write_record(&Record::StartTime(StartTime { time }))
    }

    /// Writes `hit`, preceded by a frame header if its frame is newer than the
    /// last one written.
    ///
    /// # Errors
    /// Returns any error raised by the writer.
    pub fn write_hit(&mut self, hit: &RawHit) -> io::Result<()> {
        let frame_id = frame_id_of(hit.time, self.clock_period_ps);
        if self.current_frame_id.map_or(true, |current| frame_id > current) {
            self.write_record(&Record::FrameHeader(FrameHeader { frame_id, drift: 0 }))?;
            self.current_frame_id = Some(frame_id);
        }
        self.write_record(&Record::from_raw_hit(hit))
    }

    /// Writes one record verbatim.
    ///
    /// # Errors
    /// Returns any error raised by the writer.
    pub fn write_record(&mut self, record: &Record) -> io::Result<()> {
        let written = record.write_to(&mut self.writer)?;
        self.position += written as u64;
        Ok(())
    }

    /// Flushes the underlying writer.
    ///
    /// # Errors
    /// Returns any error raised by the writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Mutable access to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::FrameDecoder;
    use crate::timing::tofpet_times;
    use std::convert::Infallible;
    use tofpet_core::{RawData, SystemConfig};

    const T: i64 = 6250;

    fn tofpet_hit(frame_id: u64, t_coarse: u16, e_coarse: u16, channel_id: u32) -> RawHit {
        let (time, time_end) = tofpet_times(frame_id, t_coarse, e_coarse, T);
        RawHit {
            time,
            time_end,
            channel_id,
            channel_idle_time: 0,
            data: RawData::Tofpet {
                tac: 0,
                t_coarse,
                e_coarse,
                t_fine: 100,
                e_fine: 200,
                tac_idle_time: 0,
            },
        }
    }

    #[test]
    fn test_frame_headers_only_when_frame_advances() {
        let mut encoder = FrameEncoder::new(Vec::new(), T);
        encoder.write_hit(&tofpet_hit(0, 10, 20, 1)).unwrap();
        encoder.write_hit(&tofpet_hit(0, 30, 40, 2)).unwrap();
        encoder.write_hit(&tofpet_hit(2, 5, 6, 3)).unwrap();
        // header + hit + hit + header + hit
        assert_eq!(encoder.position(), 17 + 30 + 30 + 17 + 30);

        encoder.reset_frame();
        encoder.write_hit(&tofpet_hit(2, 7, 8, 3)).unwrap();
        assert_eq!(encoder.position(), 2 * 17 + 3 * 30 + 17 + 30);
    }

    #[test]
    fn test_hits_survive_encode_decode() {
        let hits = vec![
            tofpet_hit(0, 10, 20, 1),
            tofpet_hit(1, 1000, 10, 2),
            tofpet_hit(4, 3, 9, 3),
        ];
        let mut encoder = FrameEncoder::new(Vec::new(), T);
        encoder.write_start_time(0).unwrap();
        for hit in &hits {
            encoder.write_hit(hit).unwrap();
        }
        let bytes = encoder.into_inner();

        let mut decoder = FrameDecoder::new(&SystemConfig::default());
        let mut decoded = Vec::new();
        decoder
            .decode_slice(&bytes, |hit| {
                decoded.push(hit);
                Ok::<(), Infallible>(())
            })
            .unwrap();
        assert_eq!(decoded, hits);
    }
}
