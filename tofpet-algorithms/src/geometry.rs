//! Channel to crystal position mapping.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tofpet_core::{EventBuffer, EventHandler, Hit};

/// Position of one crystal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrystalPosition {
    /// Readout channel.
    pub channel: u32,
    /// Detector region (module).
    pub region: u16,
    /// Position (mm).
    pub x: f32,
    /// Position (mm).
    pub y: f32,
    /// Position (mm).
    pub z: f32,
}

/// How channels map to crystal positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrystalGeometry {
    /// Regions of `channels_per_region` crystals laid out row by row in a
    /// grid of `columns` columns with `pitch_mm` spacing, at `z = 0`.
    Regular {
        /// Crystals per region.
        channels_per_region: u32,
        /// Grid columns.
        columns: u32,
        /// Crystal pitch (mm).
        pitch_mm: f32,
    },
    /// Explicit per-channel positions.
    Explicit(Vec<CrystalPosition>),
}

impl Default for CrystalGeometry {
    fn default() -> Self {
        CrystalGeometry::Regular {
            channels_per_region: 64,
            columns: 8,
            pitch_mm: 3.1,
        }
    }
}

impl CrystalGeometry {
    /// Loads a geometry from a JSON file.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the file cannot be opened and
    /// [`Error::Json`] if it is malformed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Builds the per-channel lookup table for `n_channels` channels.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty regular layout or a
    /// region number that does not fit.
    #[allow(clippy::cast_precision_loss)]
    fn build(&self, n_channels: u32) -> Result<Vec<Option<CrystalPosition>>> {
        let mut lookup = vec![None; n_channels as usize];
        match self {
            CrystalGeometry::Regular {
                channels_per_region,
                columns,
                pitch_mm,
            } => {
                if *channels_per_region == 0 || *columns == 0 {
                    return Err(Error::InvalidConfig(
                        "regular geometry needs at least one channel per region and one column"
                            .into(),
                    ));
                }
                for channel in 0..n_channels {
                    let region = u16::try_from(channel / channels_per_region).map_err(|_| {
                        Error::InvalidConfig(format!("channel {channel} maps past region 65535"))
                    })?;
                    let index = channel % channels_per_region;
                    lookup[channel as usize] = Some(CrystalPosition {
                        channel,
                        region,
                        x: (index % columns) as f32 * pitch_mm,
                        y: (index / columns) as f32 * pitch_mm,
                        z: 0.0,
                    });
                }
            }
            CrystalGeometry::Explicit(positions) => {
                let mut seen = HashMap::new();
                for position in positions {
                    if let Some(previous) = seen.insert(position.channel, position) {
                        log::warn!(
                            "channel {} listed twice, keeping the last entry (was region {})",
                            position.channel,
                            previous.region
                        );
                    }
                    if let Some(slot) = lookup.get_mut(position.channel as usize) {
                        *slot = Some(*position);
                    }
                }
            }
        }
        Ok(lookup)
    }
}

/// Assigns region and position to calibrated hits.
///
/// Hits on channels the geometry does not describe are dropped and counted.
/// Every record of a chunk is mapped: the upstream calibration already
/// selected hits on their raw time, and its offsets may move a hit past the
/// window edge.
#[derive(Debug)]
pub struct PositionMapper {
    lookup: Vec<Option<CrystalPosition>>,
    n_mapped: AtomicU64,
    n_unmapped: AtomicU64,
}

impl PositionMapper {
    /// Creates a mapping stage for `n_channels` channels.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the geometry is unusable.
    pub fn new(geometry: &CrystalGeometry, n_channels: u32) -> Result<Self> {
        Ok(Self {
            lookup: geometry.build(n_channels)?,
            n_mapped: AtomicU64::new(0),
            n_unmapped: AtomicU64::new(0),
        })
    }

    /// Position of a channel, if mapped.
    #[must_use]
    pub fn position(&self, channel: u32) -> Option<&CrystalPosition> {
        self.lookup.get(channel as usize)?.as_ref()
    }

    /// Hits mapped and hits dropped so far.
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        (
            self.n_mapped.load(Ordering::Relaxed),
            self.n_unmapped.load(Ordering::Relaxed),
        )
    }
}

impl EventHandler for PositionMapper {
    type Input = Hit;
    type Output = Hit;

    fn name(&self) -> &'static str {
        "crystal-positions"
    }

    fn handle_events(&self, chunk: &EventBuffer<Hit>) -> EventBuffer<Hit> {
        let mut out = EventBuffer::new(chunk.len());
        out.set_window(chunk.t_min(), chunk.t_max());
        let mut unmapped = 0;
        for hit in chunk {
            let Some(position) = self.position(hit.raw.channel_id) else {
                unmapped += 1;
                continue;
            };
            let slot = out.write_slot();
            *slot = *hit;
            slot.region = position.region;
            slot.x = position.x;
            slot.y = position.y;
            slot.z = position.z;
            out.push_write_slot();
        }
        self.n_mapped.fetch_add(out.len() as u64, Ordering::Relaxed);
        self.n_unmapped.fetch_add(unmapped, Ordering::Relaxed);
        out
    }

    fn report(&self) {
        let (mapped, unmapped) = self.counts();
        log::info!("crystal-positions: {mapped} hits mapped, {unmapped} on unmapped channels");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tofpet_core::RawHit;

    fn hit(channel_id: u32, time: i64) -> Hit {
        Hit {
            raw: RawHit {
                channel_id,
                ..RawHit::default()
            },
            time,
            ..Hit::default()
        }
    }

    #[test]
    fn test_regular_layout() {
        let geometry = CrystalGeometry::Regular {
            channels_per_region: 16,
            columns: 4,
            pitch_mm: 2.0,
        };
        let mapper = PositionMapper::new(&geometry, 64).unwrap();
        let p = mapper.position(16 + 6).unwrap();
        assert_eq!(p.region, 1);
        assert_relative_eq!(p.x, 4.0);
        assert_relative_eq!(p.y, 2.0);
        assert!(mapper.position(64).is_none());
    }

    #[test]
    fn test_explicit_layout_from_json() {
        let json = r#"{ "explicit": [
            { "channel": 3, "region": 7, "x": 1.0, "y": 2.0, "z": 3.0 }
        ] }"#;
        let geometry: CrystalGeometry = serde_json::from_str(json).unwrap();
        let mapper = PositionMapper::new(&geometry, 8).unwrap();

        let chunk = EventBuffer::from_records(vec![hit(3, 10), hit(4, 20)], 0, 50);
        let out = mapper.handle_events(&chunk);
        assert_eq!(out.len(), 1);
        let mapped = out.get(0).unwrap();
        assert_eq!(mapped.region, 7);
        assert_relative_eq!(mapped.z, 3.0);
        assert_eq!(mapper.counts(), (1, 1));
    }

    #[test]
    fn test_hits_shifted_past_window_are_kept() {
        let mapper = PositionMapper::new(&CrystalGeometry::default(), 8).unwrap();
        let chunk = EventBuffer::from_records(vec![hit(0, -5), hit(1, 20), hit(2, 57)], 0, 50);
        let out = mapper.handle_events(&chunk);
        assert_eq!(out.len(), 3);
        assert_eq!((out.t_min(), out.t_max()), (0, 50));
        assert_eq!(mapper.counts(), (3, 0));
    }

    #[test]
    fn test_empty_regular_layout_rejected() {
        let geometry = CrystalGeometry::Regular {
            channels_per_region: 0,
            columns: 4,
            pitch_mm: 1.0,
        };
        assert!(PositionMapper::new(&geometry, 8).is_err());
    }
}
