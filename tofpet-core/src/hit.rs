//! Raw and calibrated hit types.

/// Records that carry an absolute time in picoseconds.
///
/// Stages use this time to decide which buffer window owns a record.
pub trait Timed {
    /// Absolute time in picoseconds.
    fn time(&self) -> i64;
}

/// Front-end ASIC family that produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontEnd {
    /// TOFPET ASIC (TAC-based TDC, record type 2).
    Tofpet,
    /// STIC ASIC (record type 3).
    Stic,
}

/// Front-end specific raw fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawData {
    /// TOFPET counters.
    Tofpet {
        /// TAC that digitised the hit.
        tac: u8,
        /// Coarse time counter (frame-local, 10 bits).
        t_coarse: u16,
        /// Coarse energy (end) counter (frame-local, 10 bits).
        e_coarse: u16,
        /// Fine time code.
        t_fine: u16,
        /// Fine energy code.
        e_fine: u16,
        /// Time since this TAC last fired, in clock cycles.
        tac_idle_time: i64,
    },
    /// STIC counters.
    Stic {
        /// Coarse time counter as stored (before LFSR compensation).
        t_coarse: u16,
        /// Coarse energy counter as stored (before LFSR compensation).
        e_coarse: u16,
        /// Fine time code.
        t_fine: u16,
        /// Fine energy code.
        e_fine: u16,
        /// Time-edge bad hit flag.
        t_bad_hit: bool,
        /// Energy-edge bad hit flag.
        e_bad_hit: bool,
    },
}

impl Default for RawData {
    fn default() -> Self {
        RawData::Tofpet {
            tac: 0,
            t_coarse: 0,
            e_coarse: 0,
            t_fine: 0,
            e_fine: 0,
            tac_idle_time: 0,
        }
    }
}

/// One hardware-decoded pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawHit {
    /// Absolute leading-edge time (ps).
    pub time: i64,
    /// Absolute trailing-edge time (ps).
    pub time_end: i64,
    /// Readout channel.
    pub channel_id: u32,
    /// Time since the channel last fired, in clock cycles.
    pub channel_idle_time: i64,
    /// Front-end specific counters.
    pub data: RawData,
}

impl RawHit {
    /// Returns the front-end family of this hit.
    #[inline]
    #[must_use]
    pub fn front_end(&self) -> FrontEnd {
        match self.data {
            RawData::Tofpet { .. } => FrontEnd::Tofpet,
            RawData::Stic { .. } => FrontEnd::Stic,
        }
    }

    /// Returns the TAC id for TOFPET hits and 0 for STIC hits.
    #[inline]
    #[must_use]
    pub fn tac(&self) -> u8 {
        match self.data {
            RawData::Tofpet { tac, .. } => tac,
            RawData::Stic { .. } => 0,
        }
    }

    /// Raw pulse width (ps).
    #[inline]
    #[must_use]
    pub fn width(&self) -> i64 {
        self.time_end - self.time
    }
}

impl Timed for RawHit {
    #[inline]
    fn time(&self) -> i64 {
        self.time
    }
}

/// A calibrated pulse.
///
/// The originating raw record is copied in rather than referenced so that a
/// hit never pins the raw buffer it came from.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Hit {
    /// Originating raw hit.
    pub raw: RawHit,
    /// Calibrated leading-edge time (ps).
    pub time: i64,
    /// Calibrated trailing-edge time (ps).
    pub time_end: i64,
    /// Energy from the channel response curve.
    pub energy: f32,
    /// Quality metric of the time edge.
    pub tofpet_tqt: f32,
    /// Quality metric of the energy edge.
    pub tofpet_tqe: f32,
    /// Set when either quality metric is outside the normal range.
    pub bad_event: bool,
    /// Detector region (module) the channel belongs to.
    pub region: u16,
    /// Crystal position (mm).
    pub x: f32,
    /// Crystal position (mm).
    pub y: f32,
    /// Crystal position (mm).
    pub z: f32,
    /// Energy attributed to channels that did not fire.
    pub missing_energy: f32,
    /// Number of channels that did not fire.
    pub n_missing: u16,
}

impl Hit {
    /// Calibrated pulse width in nanoseconds.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tot_ns(&self) -> f32 {
        (self.time_end - self.time) as f32 * 1e-3
    }

    /// Squared Euclidean distance to another hit (mm²).
    #[inline]
    #[must_use]
    pub fn distance_squared(&self, other: &Self) -> f32 {
        let u = self.x - other.x;
        let v = self.y - other.y;
        let w = self.z - other.z;
        u * u + v * v + w * w
    }
}

impl Timed for Hit {
    #[inline]
    fn time(&self) -> i64 {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_front_end_tag() {
        let tofpet = RawHit::default();
        assert_eq!(tofpet.front_end(), FrontEnd::Tofpet);

        let stic = RawHit {
            data: RawData::Stic {
                t_coarse: 1,
                e_coarse: 2,
                t_fine: 3,
                e_fine: 4,
                t_bad_hit: false,
                e_bad_hit: true,
            },
            ..RawHit::default()
        };
        assert_eq!(stic.front_end(), FrontEnd::Stic);
        assert_eq!(stic.tac(), 0);
    }

    #[test]
    fn test_distance_uses_all_three_axes() {
        let a = Hit::default();
        let b = Hit {
            x: 1.0,
            y: 2.0,
            z: 2.0,
            ..Hit::default()
        };
        assert_relative_eq!(a.distance_squared(&b), 9.0);
    }

    #[test]
    fn test_tot_ns() {
        let hit = Hit {
            time: 1_000,
            time_end: 101_000,
            ..Hit::default()
        };
        assert_relative_eq!(hit.tot_ns(), 100.0);
    }
}
