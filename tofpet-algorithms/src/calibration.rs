//! Raw hit to calibrated hit conversion.

use crate::lut::{CalibrationTable, Edge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tofpet_core::{EventBuffer, EventHandler, Hit, RawData, RawHit, SystemConfig};

/// Coarse counter value below which an end edge may have wrapped.
const WRAP_LOW: u16 = 384;
/// Coarse counter value above which a start edge may precede a wrap.
const WRAP_HIGH: u16 = 640;

/// Calibration stage options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationConfig {
    /// Drop hits whose coarse ToT is zero.
    pub kill_zero_tot: bool,
    /// Allowed excursion of the time-edge `q` outside `[1, 3]`.
    pub t_denormal_tolerance: f32,
    /// Allowed excursion of the energy-edge `q` outside `[1, 3]`.
    pub e_denormal_tolerance: f32,
    /// Drop hits with a `q` out of range instead of flagging them.
    pub kill_denormal: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            kill_zero_tot: false,
            t_denormal_tolerance: 0.0,
            e_denormal_tolerance: 0.0,
            kill_denormal: false,
        }
    }
}

impl CalibrationConfig {
    /// Sets whether zero-ToT hits are dropped.
    #[must_use]
    pub fn with_kill_zero_tot(mut self, kill: bool) -> Self {
        self.kill_zero_tot = kill;
        self
    }

    /// Sets both denormal tolerances.
    #[must_use]
    pub fn with_denormal_tolerance(mut self, t_tolerance: f32, e_tolerance: f32) -> Self {
        self.t_denormal_tolerance = t_tolerance;
        self.e_denormal_tolerance = e_tolerance;
        self
    }

    /// Sets whether denormal hits are dropped.
    #[must_use]
    pub fn with_kill_denormal(mut self, kill: bool) -> Self {
        self.kill_denormal = kill;
        self
    }
}

/// Snapshot of calibration counters.
///
/// Every hit inside a window is counted in `n_event` and in exactly one of
/// `n_wrong_front_end`, `n_zero_tot`, `n_not_normal` and `n_passed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CalibrationStats {
    /// Hits received inside the window.
    pub n_event: u64,
    /// Hits dropped for a zero coarse ToT.
    pub n_zero_tot: u64,
    /// Hits with a `q` out of range, flagged or dropped.
    pub n_not_normal: u64,
    /// Hits from a front end this stage cannot calibrate.
    pub n_wrong_front_end: u64,
    /// Hits calibrated normally.
    pub n_passed: u64,
}

#[derive(Debug, Default)]
struct AtomicCalibrationStats {
    n_event: AtomicU64,
    n_zero_tot: AtomicU64,
    n_not_normal: AtomicU64,
    n_wrong_front_end: AtomicU64,
    n_passed: AtomicU64,
}

impl AtomicCalibrationStats {
    fn snapshot(&self) -> CalibrationStats {
        CalibrationStats {
            n_event: self.n_event.load(Ordering::Relaxed),
            n_zero_tot: self.n_zero_tot.load(Ordering::Relaxed),
            n_not_normal: self.n_not_normal.load(Ordering::Relaxed),
            n_wrong_front_end: self.n_wrong_front_end.load(Ordering::Relaxed),
            n_passed: self.n_passed.load(Ordering::Relaxed),
        }
    }
}

/// Coarse ToT in clock cycles, undoing a frame wrap of the end edge.
#[inline]
#[must_use]
pub fn coarse_tot(t_coarse: u16, e_coarse: u16) -> i64 {
    let tot = i64::from(e_coarse) - i64::from(t_coarse);
    if e_coarse < WRAP_LOW && t_coarse > WRAP_HIGH {
        tot + 1024
    } else {
        tot
    }
}

/// Calibrates TOFPET raw hits with a shared [`CalibrationTable`].
#[derive(Debug)]
pub struct Calibrator {
    table: Arc<CalibrationTable>,
    config: CalibrationConfig,
    clock_period_ps: i64,
    stats: AtomicCalibrationStats,
}

impl Calibrator {
    /// Creates a calibration stage.
    #[must_use]
    pub fn new(table: Arc<CalibrationTable>, config: CalibrationConfig, system: &SystemConfig) -> Self {
        Self {
            table,
            config,
            clock_period_ps: system.clock_period_ps,
            stats: AtomicCalibrationStats::default(),
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> CalibrationStats {
        self.stats.snapshot()
    }

    /// Fills `hit` from `raw`. Returns false if the hit is rejected.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn calibrate(&self, raw: &RawHit, hit: &mut Hit) -> bool {
        self.stats.n_event.fetch_add(1, Ordering::Relaxed);
        let RawData::Tofpet {
            tac,
            t_coarse,
            e_coarse,
            t_fine,
            e_fine,
            tac_idle_time,
        } = raw.data
        else {
            self.stats.n_wrong_front_end.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let tot_cycles = coarse_tot(t_coarse, e_coarse);
        if self.config.kill_zero_tot && tot_cycles == 0 {
            self.stats.n_zero_tot.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let period = self.clock_period_ps;
        let charge_ns = (tot_cycles * period / 1000) as f32;
        let channel = raw.channel_id;
        let table = &self.table;

        hit.raw = *raw;
        hit.tofpet_tqt = table.q(channel, tac, Edge::Time, t_fine, tac_idle_time);
        hit.tofpet_tqe = table.q(channel, tac, Edge::Energy, e_fine, tac_idle_time);

        let t_tol = self.config.t_denormal_tolerance;
        let e_tol = self.config.e_denormal_tolerance;
        let normal = (1.0 - t_tol..=3.0 + t_tol).contains(&hit.tofpet_tqt)
            && (1.0 - e_tol..=3.0 + e_tol).contains(&hit.tofpet_tqe);

        if normal {
            let f_t = table.fraction(channel, tac, Edge::Time, t_fine, tac_idle_time, charge_ns);
            let f_e = table.fraction(channel, tac, Edge::Energy, e_fine, tac_idle_time, charge_ns);
            let offset = f64::from(table.time_offset_ps(channel)).round() as i64;
            hit.bad_event = false;
            hit.time = raw.time + (f64::from(f_t) * period as f64).round() as i64 + offset;
            hit.time_end = raw.time_end + (f64::from(f_e) * period as f64).round() as i64 + offset;
        } else {
            self.stats.n_not_normal.fetch_add(1, Ordering::Relaxed);
            hit.bad_event = true;
            hit.time = raw.time;
            hit.time_end = raw.time_end;
            if self.config.kill_denormal {
                return false;
            }
        }

        hit.energy = table.energy(channel, (hit.time_end - hit.time) as f32 * 1e-3);
        if normal {
            self.stats.n_passed.fetch_add(1, Ordering::Relaxed);
        }
        true
    }
}

impl EventHandler for Calibrator {
    type Input = RawHit;
    type Output = Hit;

    fn name(&self) -> &'static str {
        "calibration"
    }

    fn handle_events(&self, chunk: &EventBuffer<RawHit>) -> EventBuffer<Hit> {
        let mut out = EventBuffer::new(chunk.len());
        out.set_window(chunk.t_min(), chunk.t_max());
        for raw in chunk.iter_in_window() {
            let slot = out.write_slot();
            if self.calibrate(raw, slot) {
                out.push_write_slot();
            }
        }
        out
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self) {
        let s = self.stats();
        let pct = |n: u64| {
            if s.n_event == 0 {
                0.0
            } else {
                100.0 * n as f64 / s.n_event as f64
            }
        };
        log::info!("calibration: {} events received", s.n_event);
        log::info!(
            "calibration: {} ({:.1}%) discarded for zero ToT",
            s.n_zero_tot,
            pct(s.n_zero_tot)
        );
        log::info!(
            "calibration: {} ({:.1}%) not normal",
            s.n_not_normal,
            pct(s.n_not_normal)
        );
        log::info!("calibration: {} ({:.1}%) passed", s.n_passed, pct(s.n_passed));
        if s.n_wrong_front_end > 0 {
            log::warn!(
                "calibration: {} ({:.1}%) hits from a non-TOFPET front end were dropped",
                s.n_wrong_front_end,
                pct(s.n_wrong_front_end)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lut::{EdgeCalibration, TacCalibration};
    use approx::assert_relative_eq;

    const T: i64 = 6250;

    fn raw(time_cycles: i64, t_coarse: u16, e_coarse: u16, t_fine: u16) -> RawHit {
        RawHit {
            time: time_cycles * T,
            time_end: (time_cycles + coarse_tot(t_coarse, e_coarse)) * T,
            channel_id: 0,
            channel_idle_time: 0,
            data: RawData::Tofpet {
                tac: 0,
                t_coarse,
                e_coarse,
                t_fine,
                e_fine: t_fine,
                tac_idle_time: 0,
            },
        }
    }

    fn window(hits: Vec<RawHit>) -> EventBuffer<RawHit> {
        EventBuffer::from_records(hits, 0, i64::MAX)
    }

    fn calibrator(table: CalibrationTable, config: CalibrationConfig) -> Calibrator {
        Calibrator::new(Arc::new(table), config, &SystemConfig::default())
    }

    #[test]
    fn test_coarse_tot_wrap() {
        assert_eq!(coarse_tot(100, 110), 10);
        assert_eq!(coarse_tot(1000, 10), 34);
        assert_eq!(coarse_tot(500, 10), -490);
    }

    #[test]
    fn test_uncalibrated_passes_raw_times() {
        let stage = calibrator(CalibrationTable::new(4), CalibrationConfig::default());
        let out = stage.handle_events(&window(vec![raw(100, 100, 116, 0)]));

        assert_eq!(out.len(), 1);
        let hit = out.get(0).unwrap();
        assert_eq!(hit.time, 100 * T);
        assert_eq!(hit.time_end, 116 * T);
        assert!(!hit.bad_event);
        // Identity response: 16 cycles of 6.25 ns.
        assert_relative_eq!(hit.energy, 100.0);
        assert_eq!(stage.stats().n_passed, 1);
    }

    #[test]
    fn test_fraction_and_offset_applied() {
        let mut table = CalibrationTable::new(4);
        let edge = EdgeCalibration::Tac(TacCalibration {
            baseline: 0.0,
            idle_slope: 0.0,
            slope: 100.0,
            curvature: 0.0,
            edge_offset: 2.5,
            walk: 0.0,
        });
        table.set_edge(0, 0, Edge::Time, edge).unwrap();
        table.set_edge(0, 0, Edge::Energy, edge).unwrap();
        table.set_time_offset_ps(0, -1000.0);
        let stage = calibrator(table, CalibrationConfig::default());

        // q = 200 / 100 = 2, fraction = 0.5 cycle.
        let out = stage.handle_events(&window(vec![raw(10, 10, 20, 200)]));
        let hit = out.get(0).unwrap();
        assert_relative_eq!(hit.tofpet_tqt, 2.0);
        assert_eq!(hit.time, 10 * T + T / 2 - 1000);
        assert_eq!(hit.time_end - hit.time, 10 * T);
    }

    #[test]
    fn test_denormal_flagged_or_killed() {
        let mut table = CalibrationTable::new(4);
        table.set_all(5.0);
        let shared = Arc::new(table);

        let flag = Calibrator::new(
            Arc::clone(&shared),
            CalibrationConfig::default(),
            &SystemConfig::default(),
        );
        let out = flag.handle_events(&window(vec![raw(0, 0, 10, 0)]));
        assert_eq!(out.len(), 1);
        assert!(out.get(0).unwrap().bad_event);
        assert_eq!(flag.stats().n_not_normal, 1);
        assert_eq!(flag.stats().n_passed, 0);

        let kill = Calibrator::new(
            shared,
            CalibrationConfig::default().with_kill_denormal(true),
            &SystemConfig::default(),
        );
        assert!(kill.handle_events(&window(vec![raw(0, 0, 10, 0)])).is_empty());

        let tolerant = calibrator(
            {
                let mut t = CalibrationTable::new(4);
                t.set_all(3.5);
                t
            },
            CalibrationConfig::default().with_denormal_tolerance(0.5, 0.5),
        );
        let out = tolerant.handle_events(&window(vec![raw(0, 0, 10, 0)]));
        assert!(!out.get(0).unwrap().bad_event);
    }

    #[test]
    fn test_stic_and_out_of_window_hits_skipped() {
        let stage = calibrator(CalibrationTable::new(4), CalibrationConfig::default());
        let stic = RawHit {
            data: RawData::Stic {
                t_coarse: 0,
                e_coarse: 0,
                t_fine: 0,
                e_fine: 0,
                t_bad_hit: false,
                e_bad_hit: false,
            },
            time: 5,
            ..RawHit::default()
        };
        let mut chunk = EventBuffer::from_records(vec![stic, raw(1, 1, 5, 0), raw(50, 50, 55, 0)], 0, 10 * T);
        let out = stage.handle_events(&chunk);
        assert_eq!(out.len(), 1);
        assert_eq!(out.t_max(), 10 * T);
        assert_eq!(stage.stats().n_wrong_front_end, 1);
        assert_eq!(stage.stats().n_event, 2);

        chunk.set_window(0, 0);
        assert!(stage.handle_events(&chunk).is_empty());
    }
}
