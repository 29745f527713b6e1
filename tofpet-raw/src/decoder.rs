//! Stateful raw stream decoder.
//!
//! Start-time and frame-header records update decoder state; hit records are
//! converted to [`RawHit`]s with absolute times relative to the current frame.

use crate::record::{Record, SticRecord, TofpetRecord};
use crate::timing::{stic_times, tofpet_times};
use tofpet_core::{RawData, RawHit, SystemConfig};

/// How a call to [`FrameDecoder::decode_slice`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Every byte was consumed.
    Complete {
        /// Bytes consumed.
        consumed: usize,
    },
    /// Decoding stopped at an unknown type byte or a truncated record.
    Malformed {
        /// Type byte of the offending record.
        code: u8,
        /// Offset of the offending record within the slice.
        offset: usize,
    },
}

impl DecodeOutcome {
    /// Returns true if decoding stopped early.
    #[must_use]
    pub fn is_malformed(&self) -> bool {
        matches!(self, DecodeOutcome::Malformed { .. })
    }
}

/// Counters kept by a [`FrameDecoder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub start_times: u64,
    pub frame_headers: u64,
    pub tofpet_hits: u64,
    pub stic_hits: u64,
    /// Hits dropped because their channel is outside the system.
    pub discarded_channel: u64,
}

impl DecoderStats {
    /// Hits handed on.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.tofpet_hits + self.stic_hits
    }
}

/// Decoder for one raw stream.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    n_channels: u32,
    clock_period_ps: i64,
    acq_start_time: i64,
    current_frame_id: u64,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Creates a decoder positioned before frame 0.
    #[must_use]
    pub fn new(config: &SystemConfig) -> Self {
        Self {
            n_channels: config.n_channels,
            clock_period_ps: config.clock_period_ps,
            acq_start_time: 0,
            current_frame_id: 0,
            stats: DecoderStats::default(),
        }
    }

    /// Time carried by the last start-time record.
    #[must_use]
    pub fn acq_start_time(&self) -> i64 {
        self.acq_start_time
    }

    /// Frame id of the last frame header.
    #[must_use]
    pub fn current_frame_id(&self) -> u64 {
        self.current_frame_id
    }

    /// Counters so far.
    #[must_use]
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Applies one record. Returns the hit it describes, if any.
    pub fn decode_record(&mut self, record: &Record) -> Option<RawHit> {
        let hit = match record {
            Record::StartTime(start) => {
                self.stats.start_times += 1;
                self.acq_start_time = start.time;
                return None;
            }
            Record::FrameHeader(header) => {
                if self.stats.frame_headers > 0 && header.frame_id < self.current_frame_id {
                    log::debug!(
                        "frame id went back from {} to {}",
                        self.current_frame_id,
                        header.frame_id
                    );
                }
                self.stats.frame_headers += 1;
                self.current_frame_id = header.frame_id;
                return None;
            }
            Record::Tofpet(r) => self.tofpet_hit(r),
            Record::Stic(r) => self.stic_hit(r),
        };

        if hit.channel_id >= self.n_channels {
            self.stats.discarded_channel += 1;
            return None;
        }
        match hit.data {
            RawData::Tofpet { .. } => self.stats.tofpet_hits += 1,
            RawData::Stic { .. } => self.stats.stic_hits += 1,
        }
        Some(hit)
    }

    /// Decodes every record of `bytes`, handing hits to `on_hit`.
    ///
    /// Decoding stops at the first unknown or truncated record; hits decoded
    /// before it have already been delivered.
    ///
    /// # Errors
    /// Returns the first error raised by `on_hit`.
    pub fn decode_slice<F, E>(&mut self, bytes: &[u8], mut on_hit: F) -> Result<DecodeOutcome, E>
    where
        F: FnMut(RawHit) -> Result<(), E>,
    {
        let mut offset = 0;
        while offset < bytes.len() {
            let Ok(record) = Record::decode(&bytes[offset..], offset) else {
                return Ok(DecodeOutcome::Malformed {
                    code: bytes[offset],
                    offset,
                });
            };
            offset += record.encoded_len();
            if let Some(hit) = self.decode_record(&record) {
                on_hit(hit)?;
            }
        }
        Ok(DecodeOutcome::Complete { consumed: offset })
    }

    fn tofpet_hit(&self, r: &TofpetRecord) -> RawHit {
        let (time, time_end) =
            tofpet_times(self.current_frame_id, r.t_coarse, r.e_coarse, self.clock_period_ps);
        RawHit {
            time,
            time_end,
            channel_id: r.channel_id,
            channel_idle_time: r.channel_idle_time,
            data: RawData::Tofpet {
                tac: r.tac,
                t_coarse: r.t_coarse,
                e_coarse: r.e_coarse,
                t_fine: r.t_fine,
                e_fine: r.e_fine,
                tac_idle_time: r.tac_idle_time,
            },
        }
    }

    fn stic_hit(&self, r: &SticRecord) -> RawHit {
        let (time, time_end) =
            stic_times(self.current_frame_id, r.t_coarse, r.e_coarse, self.clock_period_ps);
        RawHit {
            time,
            time_end,
            channel_id: r.channel_id,
            channel_idle_time: r.channel_idle_time,
            data: RawData::Stic {
                t_coarse: r.t_coarse,
                e_coarse: r.e_coarse,
                t_fine: r.t_fine,
                e_fine: r.e_fine,
                t_bad_hit: r.t_bad_hit,
                e_bad_hit: r.e_bad_hit,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FrameHeader, StartTime};
    use std::convert::Infallible;

    fn encode(records: &[Record]) -> Vec<u8> {
        let mut out = Vec::new();
        for record in records {
            record.encode(&mut out);
        }
        out
    }

    fn collect(decoder: &mut FrameDecoder, bytes: &[u8]) -> (Vec<RawHit>, DecodeOutcome) {
        let mut hits = Vec::new();
        let outcome = decoder
            .decode_slice(bytes, |hit| {
                hits.push(hit);
                Ok::<(), Infallible>(())
            })
            .unwrap();
        (hits, outcome)
    }

    #[test]
    fn test_state_records_update_decoder() {
        let config = SystemConfig::default();
        let mut decoder = FrameDecoder::new(&config);
        let bytes = encode(&[
            Record::StartTime(StartTime { time: 1234 }),
            Record::FrameHeader(FrameHeader {
                frame_id: 3,
                drift: 0,
            }),
            Record::Tofpet(TofpetRecord {
                channel_id: 1,
                t_coarse: 5,
                e_coarse: 15,
                ..TofpetRecord::default()
            }),
        ]);

        let (hits, outcome) = collect(&mut decoder, &bytes);
        assert_eq!(outcome, DecodeOutcome::Complete { consumed: 9 + 17 + 30 });
        assert_eq!(decoder.acq_start_time(), 1234);
        assert_eq!(decoder.current_frame_id(), 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].time, (3 * 1024 + 5) * 6250);
        assert_eq!(hits[0].width(), 10 * 6250);
    }

    #[test]
    fn test_out_of_range_channel_discarded() {
        let config = SystemConfig::default().with_n_channels(4);
        let mut decoder = FrameDecoder::new(&config);
        let bytes = encode(&[
            Record::Tofpet(TofpetRecord {
                channel_id: 3,
                ..TofpetRecord::default()
            }),
            Record::Stic(SticRecord {
                channel_id: 4,
                ..SticRecord::default()
            }),
        ]);

        let (hits, _) = collect(&mut decoder, &bytes);
        assert_eq!(hits.len(), 1);
        let stats = decoder.stats();
        assert_eq!(stats.discarded_channel, 1);
        assert_eq!(stats.hits(), 1);
    }

    #[test]
    fn test_malformed_stops_after_delivering_prefix() {
        let config = SystemConfig::default();
        let mut decoder = FrameDecoder::new(&config);
        let mut bytes = encode(&[Record::Tofpet(TofpetRecord::default())]);
        bytes.push(9);
        bytes.extend_from_slice(&encode(&[Record::Tofpet(TofpetRecord::default())]));

        let (hits, outcome) = collect(&mut decoder, &bytes);
        assert_eq!(hits.len(), 1);
        assert_eq!(outcome, DecodeOutcome::Malformed { code: 9, offset: 30 });
    }

    #[test]
    fn test_truncated_tail() {
        let config = SystemConfig::default();
        let mut decoder = FrameDecoder::new(&config);
        let mut bytes = encode(&[Record::Stic(SticRecord::default())]);
        bytes.extend_from_slice(&[2, 0, 0]);

        let (hits, outcome) = collect(&mut decoder, &bytes);
        assert_eq!(hits.len(), 1);
        assert!(outcome.is_malformed());
    }

    #[test]
    fn test_callback_error_propagates() {
        let config = SystemConfig::default();
        let mut decoder = FrameDecoder::new(&config);
        let bytes = encode(&[Record::Tofpet(TofpetRecord::default())]);
        let result = decoder.decode_slice(&bytes, |_| Err("sink closed"));
        assert_eq!(result, Err("sink closed"));
    }
}
