//! Gamma photon clusters.

use crate::hit::{Hit, Timed};

/// A cluster of hits attributed to one gamma interaction.
///
/// Hits are stored time-sorted; the anchor attributes (`region`, `time`,
/// position) come from the earliest hit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GammaPhoton {
    /// Member hits, earliest first.
    pub hits: Vec<Hit>,
    /// Region of the earliest hit.
    pub region: u16,
    /// Time of the earliest hit (ps).
    pub time: i64,
    /// Position of the earliest hit (mm).
    pub x: f32,
    /// Position of the earliest hit (mm).
    pub y: f32,
    /// Position of the earliest hit (mm).
    pub z: f32,
    /// Sum of member energies.
    pub energy: f32,
    /// Sum of member missing energies.
    pub missing_energy: f32,
    /// Sum of member missing channel counts.
    pub n_missing: u32,
}

impl GammaPhoton {
    /// Builds a photon from its member hits.
    ///
    /// Members are stably sorted by time, so ties keep their input order.
    /// Returns `None` for an empty member list.
    #[must_use]
    pub fn from_hits(mut hits: Vec<Hit>) -> Option<Self> {
        hits.sort_by_key(|hit| hit.time);
        let first = *hits.first()?;

        let mut photon = Self {
            region: first.region,
            time: first.time,
            x: first.x,
            y: first.y,
            z: first.z,
            ..Self::default()
        };
        for hit in &hits {
            photon.energy += hit.energy;
            photon.missing_energy += hit.missing_energy;
            photon.n_missing += u32::from(hit.n_missing);
        }
        photon.hits = hits;
        Some(photon)
    }

    /// Number of member hits.
    #[inline]
    #[must_use]
    pub fn n_hits(&self) -> usize {
        self.hits.len()
    }
}

impl Timed for GammaPhoton {
    #[inline]
    fn time(&self) -> i64 {
        self.time
    }
}
