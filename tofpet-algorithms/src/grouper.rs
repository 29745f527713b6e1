//! Spatio-temporal grouping of hits into gamma photons.
//!
//! The earliest unclaimed hit of a chunk seeds a cluster and claims every
//! later unclaimed hit of the same region that lies within the time window
//! and the radius. Clusters larger than `max_hits` are treated as pile-up
//! and dropped. Only clusters seeded inside the chunk window are emitted,
//! so the grouper must run in a windowed stage. A hit claimed by a seed one
//! window earlier may itself have been a candidate seed one window before
//! that, so the overlap must span at least two time windows.

use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tofpet_core::{EventBuffer, EventHandler, GammaPhoton, Hit, StageConfig};

/// Largest accepted time window (ps), one hour.
pub const MAX_TIME_WINDOW_PS: i64 = 3_600_000_000_000_000;

/// Grouping parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupingConfig {
    /// Maximum distance between the seed and a member (mm).
    pub radius_mm: f32,
    /// Maximum time difference between the seed and a member (ps).
    pub time_window_ps: i64,
    /// Stage overlap (ps). Must be at least twice `time_window_ps`.
    pub overlap_ps: i64,
    /// Largest cluster emitted.
    pub max_hits: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            radius_mm: 100.0,
            time_window_ps: 100_000,
            overlap_ps: 200_000,
            max_hits: 16,
        }
    }
}

impl GroupingConfig {
    /// Sets the radius (mm).
    #[must_use]
    pub fn with_radius_mm(mut self, radius: f32) -> Self {
        self.radius_mm = radius;
        self
    }

    /// Sets the time window (ps) and raises the overlap to two windows if needed.
    #[must_use]
    pub fn with_time_window_ps(mut self, window: i64) -> Self {
        self.time_window_ps = window;
        self.overlap_ps = self.overlap_ps.max(window.saturating_mul(2));
        self
    }

    /// Sets the overlap (ps).
    #[must_use]
    pub fn with_overlap_ps(mut self, overlap: i64) -> Self {
        self.overlap_ps = overlap;
        self
    }

    /// Sets the cluster size cap.
    #[must_use]
    pub fn with_max_hits(mut self, max_hits: usize) -> Self {
        self.max_hits = max_hits;
        self
    }

    /// Stage configuration the grouper must run under.
    #[must_use]
    pub fn stage_config(&self) -> StageConfig {
        StageConfig::windowed(self.overlap_ps)
    }

    /// Checks parameter consistency.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_hits == 0 {
            return Err(Error::InvalidConfig("max_hits must be at least 1".into()));
        }
        if self.radius_mm.is_nan() || self.radius_mm <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "radius must be positive, got {} mm",
                self.radius_mm
            )));
        }
        if self.time_window_ps < 0 {
            return Err(Error::InvalidConfig(format!(
                "time window must not be negative, got {} ps",
                self.time_window_ps
            )));
        }
        if self.time_window_ps > MAX_TIME_WINDOW_PS {
            return Err(Error::InvalidConfig(format!(
                "time window must not exceed {MAX_TIME_WINDOW_PS} ps, got {} ps",
                self.time_window_ps
            )));
        }
        if self.overlap_ps < 2 * self.time_window_ps {
            return Err(Error::InvalidConfig(format!(
                "overlap ({} ps) must be at least twice the time window ({} ps)",
                self.overlap_ps, self.time_window_ps
            )));
        }
        Ok(())
    }
}

/// Snapshot of grouping counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupingStats {
    /// `size_counts[k]` photons were emitted with `k + 1` hits.
    pub size_counts: Vec<u64>,
    /// Clusters dropped for exceeding `max_hits`.
    pub n_overflow: u64,
}

impl GroupingStats {
    /// Photons emitted.
    #[must_use]
    pub fn n_photons(&self) -> u64 {
        self.size_counts.iter().sum()
    }

    /// Hits contained in emitted photons.
    #[must_use]
    pub fn n_hits(&self) -> u64 {
        self.size_counts
            .iter()
            .zip(1_u64..)
            .map(|(count, size)| count * size)
            .sum()
    }

    /// Average hits per emitted photon.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_hits(&self) -> f64 {
        let photons = self.n_photons();
        if photons == 0 {
            0.0
        } else {
            self.n_hits() as f64 / photons as f64
        }
    }
}

/// Groups calibrated, positioned hits into [`GammaPhoton`]s.
#[derive(Debug)]
pub struct NaiveGrouper {
    config: GroupingConfig,
    radius2: f32,
    size_counts: Vec<AtomicU64>,
    n_overflow: AtomicU64,
}

impl NaiveGrouper {
    /// Creates a grouper.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the configuration is inconsistent.
    pub fn new(config: GroupingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            radius2: config.radius_mm * config.radius_mm,
            size_counts: (0..config.max_hits).map(|_| AtomicU64::new(0)).collect(),
            n_overflow: AtomicU64::new(0),
            config,
        })
    }

    /// The grouping parameters.
    #[must_use]
    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> GroupingStats {
        GroupingStats {
            size_counts: self
                .size_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            n_overflow: self.n_overflow.load(Ordering::Relaxed),
        }
    }
}

impl EventHandler for NaiveGrouper {
    type Input = Hit;
    type Output = GammaPhoton;

    fn name(&self) -> &'static str {
        "naive-grouper"
    }

    fn handle_events(&self, chunk: &EventBuffer<Hit>) -> EventBuffer<GammaPhoton> {
        let mut hits: Vec<Hit> = chunk.iter().copied().collect();
        hits.sort_by_key(|hit| hit.time);

        let window = self.config.time_window_ps;
        let reach = window.saturating_add(self.config.overlap_ps);
        let max_hits = self.config.max_hits;

        let mut out = EventBuffer::new(hits.len());
        out.set_window(chunk.t_min(), chunk.t_max());
        let mut local_counts = vec![0_u64; max_hits];
        let mut local_overflow = 0_u64;

        let mut taken = vec![false; hits.len()];
        let mut members = Vec::with_capacity(max_hits + 1);
        for i in 0..hits.len() {
            if taken[i] {
                continue;
            }
            taken[i] = true;
            let seed = &hits[i];
            members.clear();
            members.push(i);

            for j in (i + 1)..hits.len() {
                if taken[j] {
                    continue;
                }
                let other = &hits[j];
                if other.region != seed.region {
                    continue;
                }
                let dt = other.time - seed.time;
                if dt > reach {
                    break;
                }
                if dt.abs() <= window && seed.distance_squared(other) < self.radius2 {
                    taken[j] = true;
                    members.push(j);
                }
            }

            if !chunk.contains_time(seed.time) {
                continue;
            }
            if members.len() > max_hits {
                local_overflow += 1;
                continue;
            }
            let cluster: Vec<Hit> = members.iter().map(|&k| hits[k]).collect();
            if let Some(photon) = GammaPhoton::from_hits(cluster) {
                local_counts[photon.n_hits() - 1] += 1;
                out.push(photon);
            }
        }

        for (counter, n) in self.size_counts.iter().zip(local_counts) {
            if n > 0 {
                counter.fetch_add(n, Ordering::Relaxed);
            }
        }
        self.n_overflow.fetch_add(local_overflow, Ordering::Relaxed);
        out
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self) {
        let stats = self.stats();
        let total = stats.n_photons() + stats.n_overflow;
        let pct = |n: u64| {
            if total == 0 {
                0.0
            } else {
                100.0 * n as f64 / total as f64
            }
        };
        log::info!("naive-grouper: {total} clusters found");
        for (k, &count) in stats.size_counts.iter().enumerate() {
            if count > 0 {
                log::info!(
                    "naive-grouper: {count:>10} ({:4.1}%) with {} hits",
                    pct(count),
                    k + 1
                );
            }
        }
        log::info!(
            "naive-grouper: {:>10} ({:4.1}%) with more than {} hits (dropped)",
            stats.n_overflow,
            pct(stats.n_overflow),
            self.config.max_hits
        );
        log::info!(
            "naive-grouper: {:.1} average hits/photon",
            stats.average_hits()
        );
    }
}
