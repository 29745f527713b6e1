//! Per-channel, per-TAC calibration table.
//!
//! Every `(channel, tac, edge)` triple has an [`EdgeCalibration`] that turns
//! a fine counter value into a quality metric `q` and a sub-clock time
//! fraction. Each channel also carries a time offset and a ToT to energy
//! response. Tables are loaded once and then shared read-only.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Number of TACs per TOFPET channel.
pub const TACS_PER_CHANNEL: u8 = 4;

/// Quality metric used when no calibration is available.
pub const UNCALIBRATED_Q: f32 = 2.0;

/// Which edge of the pulse a fine counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Leading (time) edge.
    Time,
    /// Trailing (energy) edge.
    Energy,
}

impl Edge {
    fn index(self) -> usize {
        match self {
            Edge::Time => 0,
            Edge::Energy => 1,
        }
    }
}

/// TAC transfer function parameters.
///
/// With `x = fine - (baseline + idle_slope * idle_cycles)`:
/// `q = x / slope + curvature * x²` and
/// `fraction = edge_offset - q - walk / sqrt(max(tot_ns, 1))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TacCalibration {
    /// Fine counter value of a zero-length TAC ramp.
    pub baseline: f32,
    /// Baseline drift per idle clock cycle.
    #[serde(default)]
    pub idle_slope: f32,
    /// Fine counts per clock cycle.
    pub slope: f32,
    /// Second order correction.
    #[serde(default)]
    pub curvature: f32,
    /// Edge offset in clock cycles.
    pub edge_offset: f32,
    /// Time-walk coefficient in clock cycles times sqrt(ns).
    #[serde(default)]
    pub walk: f32,
}

/// Calibration of one edge of one TAC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCalibration {
    /// Fixed quality metric and no time correction.
    Constant(f32),
    /// TAC transfer function.
    Tac(TacCalibration),
}

impl Default for EdgeCalibration {
    fn default() -> Self {
        EdgeCalibration::Constant(UNCALIBRATED_Q)
    }
}

impl EdgeCalibration {
    /// Quality metric, nominally in `[1, 3]` for a healthy conversion.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn q(&self, fine: u16, idle_cycles: i64) -> f32 {
        match self {
            EdgeCalibration::Constant(q) => *q,
            EdgeCalibration::Tac(c) => {
                let x = f32::from(fine) - (c.baseline + c.idle_slope * idle_cycles as f32);
                x / c.slope + c.curvature * x * x
            }
        }
    }

    /// Sub-clock time correction in clock cycles.
    #[must_use]
    pub fn fraction(&self, fine: u16, idle_cycles: i64, tot_ns: f32) -> f32 {
        match self {
            EdgeCalibration::Constant(_) => 0.0,
            EdgeCalibration::Tac(c) => {
                c.edge_offset - self.q(fine, idle_cycles) - c.walk / tot_ns.max(1.0).sqrt()
            }
        }
    }
}

/// Piecewise-linear ToT (ns) to energy curve.
///
/// Points are sorted by ToT; values outside the covered range are
/// extrapolated from the nearest segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnergyResponse {
    points: Vec<[f32; 2]>,
}

impl EnergyResponse {
    /// Builds a response from `(tot_ns, energy)` points.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTable`] for fewer than two points or ToT values
    /// that are not strictly increasing.
    pub fn new(points: Vec<[f32; 2]>) -> Result<Self> {
        let response = Self { points };
        response.validate()?;
        Ok(response)
    }

    fn validate(&self) -> Result<()> {
        if self.points.len() < 2 {
            return Err(Error::InvalidTable(
                "energy response needs at least two points".into(),
            ));
        }
        if self.points.windows(2).any(|w| w[1][0] <= w[0][0]) {
            return Err(Error::InvalidTable(
                "energy response ToT values must be strictly increasing".into(),
            ));
        }
        Ok(())
    }

    /// Energy for a ToT in nanoseconds.
    #[must_use]
    pub fn energy(&self, tot_ns: f32) -> f32 {
        let n = self.points.len();
        if n < 2 {
            return tot_ns;
        }
        let upper = self
            .points
            .partition_point(|p| p[0] <= tot_ns)
            .clamp(1, n - 1);
        let [x0, y0] = self.points[upper - 1];
        let [x1, y1] = self.points[upper];
        y0 + (tot_ns - x0) * (y1 - y0) / (x1 - x0)
    }
}

/// Calibration table for a whole system.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    n_channels: u32,
    edges: Vec<EdgeCalibration>,
    time_offset_ps: Vec<f32>,
    responses: Vec<Option<EnergyResponse>>,
}

impl CalibrationTable {
    /// Creates an uncalibrated table: constant `q` of 2, no offsets, identity energy.
    #[must_use]
    pub fn new(n_channels: u32) -> Self {
        let n = n_channels as usize;
        Self {
            n_channels,
            edges: vec![EdgeCalibration::default(); n * usize::from(TACS_PER_CHANNEL) * 2],
            time_offset_ps: vec![0.0; n],
            responses: vec![None; n],
        }
    }

    /// Number of channels covered.
    #[must_use]
    pub fn n_channels(&self) -> u32 {
        self.n_channels
    }

    /// Sets every edge to a constant quality metric with no time correction.
    pub fn set_all(&mut self, q: f32) {
        self.edges.fill(EdgeCalibration::Constant(q));
    }

    fn index(&self, channel: u32, tac: u8, edge: Edge) -> Option<usize> {
        (channel < self.n_channels && tac < TACS_PER_CHANNEL).then(|| {
            (channel as usize * usize::from(TACS_PER_CHANNEL) + usize::from(tac)) * 2 + edge.index()
        })
    }

    /// Calibration of one edge, `None` outside the table.
    #[must_use]
    pub fn edge(&self, channel: u32, tac: u8, edge: Edge) -> Option<&EdgeCalibration> {
        self.index(channel, tac, edge).map(|i| &self.edges[i])
    }

    /// Replaces the calibration of one edge.
    ///
    /// # Errors
    /// Returns [`Error::InvalidTable`] if the entry is outside the table.
    pub fn set_edge(
        &mut self,
        channel: u32,
        tac: u8,
        edge: Edge,
        calibration: EdgeCalibration,
    ) -> Result<()> {
        let i = self.index(channel, tac, edge).ok_or_else(|| {
            Error::InvalidTable(format!("no entry for channel {channel} tac {tac}"))
        })?;
        self.edges[i] = calibration;
        Ok(())
    }

    /// Quality metric of one edge. Entries outside the table are uncalibrated.
    #[must_use]
    pub fn q(&self, channel: u32, tac: u8, edge: Edge, fine: u16, idle_cycles: i64) -> f32 {
        self.edge(channel, tac, edge)
            .map_or(UNCALIBRATED_Q, |c| c.q(fine, idle_cycles))
    }

    /// Sub-clock time correction of one edge, in clock cycles.
    #[must_use]
    pub fn fraction(
        &self,
        channel: u32,
        tac: u8,
        edge: Edge,
        fine: u16,
        idle_cycles: i64,
        tot_ns: f32,
    ) -> f32 {
        self.edge(channel, tac, edge)
            .map_or(0.0, |c| c.fraction(fine, idle_cycles, tot_ns))
    }

    /// Time offset of a channel (ps).
    #[must_use]
    pub fn time_offset_ps(&self, channel: u32) -> f32 {
        self.time_offset_ps
            .get(channel as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Sets the time offset of a channel (ps). Ignored outside the table.
    pub fn set_time_offset_ps(&mut self, channel: u32, offset: f32) {
        if let Some(slot) = self.time_offset_ps.get_mut(channel as usize) {
            *slot = offset;
        }
    }

    /// Sets the energy response of a channel. Ignored outside the table.
    pub fn set_energy_response(&mut self, channel: u32, response: EnergyResponse) {
        if let Some(slot) = self.responses.get_mut(channel as usize) {
            *slot = Some(response);
        }
    }

    /// Energy for a ToT in nanoseconds; identity for channels without a response.
    #[must_use]
    pub fn energy(&self, channel: u32, tot_ns: f32) -> f32 {
        match self.responses.get(channel as usize) {
            Some(Some(response)) => response.energy(tot_ns),
            _ => tot_ns,
        }
    }

    /// Loads a table from a JSON file.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the file cannot be opened, [`Error::Json`]
    /// if it is malformed and [`Error::InvalidTable`] for inconsistent entries.
    pub fn from_file<P: AsRef<Path>>(path: P, n_channels: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let table: TableFile = serde_json::from_reader(BufReader::new(file))?;
        table.into_table(n_channels)
    }

    /// Loads a table from a JSON string.
    ///
    /// # Errors
    /// Returns [`Error::Json`] if the JSON is malformed and
    /// [`Error::InvalidTable`] for inconsistent entries.
    pub fn from_json(json: &str, n_channels: u32) -> Result<Self> {
        let table: TableFile = serde_json::from_str(json)?;
        table.into_table(n_channels)
    }

    /// Loads a table from `source`, or builds the uncalibrated table for `none`.
    ///
    /// # Errors
    /// Returns the errors of [`from_file`](Self::from_file).
    pub fn load(source: &str, n_channels: u32) -> Result<Self> {
        if source == "none" {
            log::warn!("no calibration table given: using constant q = {UNCALIBRATED_Q}, times are uncorrected");
            let mut table = Self::new(n_channels);
            table.set_all(UNCALIBRATED_Q);
            return Ok(table);
        }
        let table = Self::from_file(source, n_channels)?;
        log::info!("loaded calibration table '{source}' for {n_channels} channels");
        Ok(table)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableFile {
    #[serde(default)]
    default: EdgeCalibration,
    #[serde(default)]
    channels: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelEntry {
    channel: u32,
    #[serde(default)]
    time_offset_ps: f32,
    #[serde(default)]
    energy_response: Option<EnergyResponse>,
    #[serde(default)]
    tacs: Vec<TacEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TacEntry {
    tac: u8,
    time: EdgeCalibration,
    energy: EdgeCalibration,
}

impl TableFile {
    fn into_table(self, n_channels: u32) -> Result<CalibrationTable> {
        let mut table = CalibrationTable::new(n_channels);
        table.edges.fill(self.default);

        for entry in self.channels {
            if entry.channel >= n_channels {
                return Err(Error::InvalidTable(format!(
                    "channel {} outside a {n_channels}-channel system",
                    entry.channel
                )));
            }
            table.set_time_offset_ps(entry.channel, entry.time_offset_ps);
            if let Some(response) = entry.energy_response {
                response.validate()?;
                table.set_energy_response(entry.channel, response);
            }
            for tac in entry.tacs {
                for (edge, calibration) in [(Edge::Time, tac.time), (Edge::Energy, tac.energy)] {
                    if let EdgeCalibration::Tac(c) = calibration {
                        if !c.slope.is_normal() {
                            return Err(Error::InvalidTable(format!(
                                "channel {} tac {} has slope {}",
                                entry.channel, tac.tac, c.slope
                            )));
                        }
                    }
                    table.set_edge(entry.channel, tac.tac, edge, calibration)?;
                }
            }
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const TABLE: &str = r#"{
        "channels": [
            {
                "channel": 1,
                "time_offset_ps": 150.0,
                "energy_response": [[0.0, 0.0], [100.0, 511.0], [200.0, 800.0]],
                "tacs": [
                    {
                        "tac": 2,
                        "time": { "tac": { "baseline": 100.0, "slope": 50.0, "edge_offset": 2.5 } },
                        "energy": { "constant": 1.5 }
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_uncalibrated_defaults() {
        let table = CalibrationTable::new(8);
        assert_relative_eq!(table.q(3, 1, Edge::Time, 123, 0), UNCALIBRATED_Q);
        assert_relative_eq!(table.fraction(3, 1, Edge::Energy, 123, 0, 10.0), 0.0);
        assert_relative_eq!(table.energy(3, 42.0), 42.0);
        // Outside the table.
        assert_relative_eq!(table.q(8, 0, Edge::Time, 0, 0), UNCALIBRATED_Q);
        assert!(table.edge(0, 4, Edge::Time).is_none());
    }

    #[test]
    fn test_set_all() {
        let mut table = CalibrationTable::new(2);
        table.set_all(1.25);
        assert_relative_eq!(table.q(1, 3, Edge::Energy, 0, 0), 1.25);
    }

    #[test]
    fn test_tac_transfer_function() {
        let table = CalibrationTable::from_json(TABLE, 4).unwrap();
        // x = 200 - 100 = 100, q = 100 / 50 = 2
        assert_relative_eq!(table.q(1, 2, Edge::Time, 200, 0), 2.0);
        // fraction = 2.5 - 2 - 0 = 0.5
        assert_relative_eq!(table.fraction(1, 2, Edge::Time, 200, 0, 30.0), 0.5);
        assert_relative_eq!(table.q(1, 2, Edge::Energy, 999, 0), 1.5);
        assert_relative_eq!(table.time_offset_ps(1), 150.0);
        // Other TACs keep the default.
        assert_relative_eq!(table.q(1, 0, Edge::Time, 200, 0), UNCALIBRATED_Q);
    }

    #[test]
    fn test_walk_and_idle_terms() {
        let edge = EdgeCalibration::Tac(TacCalibration {
            baseline: 10.0,
            idle_slope: 0.5,
            slope: 10.0,
            curvature: 0.0,
            edge_offset: 3.0,
            walk: 2.0,
        });
        // x = 50 - (10 + 0.5 * 20) = 30, q = 3
        assert_relative_eq!(edge.q(50, 20), 3.0);
        // walk / sqrt(4) = 1
        assert_relative_eq!(edge.fraction(50, 20, 4.0), -1.0);
        // ToT below 1 ns is clamped.
        assert_relative_eq!(edge.fraction(50, 20, 0.0), -2.0);
    }

    #[test]
    fn test_energy_response_interpolation() {
        let table = CalibrationTable::from_json(TABLE, 4).unwrap();
        assert_relative_eq!(table.energy(1, 50.0), 255.5);
        assert_relative_eq!(table.energy(1, 150.0), 655.5);
        // Extrapolated from the last segment.
        assert_relative_eq!(table.energy(1, 300.0), 1089.0);
        // Channels without a response are identity.
        assert_relative_eq!(table.energy(0, 300.0), 300.0);
    }

    #[test]
    fn test_invalid_tables() {
        let outside = r#"{ "channels": [ { "channel": 9 } ] }"#;
        assert!(CalibrationTable::from_json(outside, 4).is_err());

        let flat = r#"{ "channels": [ { "channel": 0, "tacs": [
            { "tac": 0, "time": { "tac": { "baseline": 0.0, "slope": 0.0, "edge_offset": 0.0 } },
              "energy": { "constant": 2.0 } } ] } ] }"#;
        assert!(CalibrationTable::from_json(flat, 4).is_err());

        let unsorted = r#"{ "channels": [ { "channel": 0, "energy_response": [[5.0, 1.0], [1.0, 2.0]] } ] }"#;
        assert!(CalibrationTable::from_json(unsorted, 4).is_err());

        let bad_tac = r#"{ "channels": [ { "channel": 0, "tacs": [
            { "tac": 4, "time": { "constant": 2.0 }, "energy": { "constant": 2.0 } } ] } ] }"#;
        assert!(CalibrationTable::from_json(bad_tac, 4).is_err());
    }

    #[test]
    fn test_load_none() {
        let table = CalibrationTable::load("none", 16).unwrap();
        assert_eq!(table.n_channels(), 16);
        assert_relative_eq!(table.q(0, 0, Edge::Time, 0, 0), UNCALIBRATED_Q);
    }

    #[test]
    fn test_missing_file_keeps_os_error() {
        let err = CalibrationTable::from_file("/nonexistent/table.json", 4).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        assert!(err.raw_os_error().is_some());
    }
}
