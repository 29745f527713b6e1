//! tofpet-algorithms: Processing stages for TOFPET hit streams.
//!
//! This crate provides the stages that run between the raw reader and the
//! terminal sinks:
//! - **Calibration** - raw counters to calibrated times and energy
//! - **Crystal positions** - channel to region and position mapping
//! - **Naive grouping** - spatio-temporal clustering into gamma photons
//!
//! Each stage is an [`EventHandler`](tofpet_core::EventHandler) meant to be
//! wrapped in an [`OverlappedStage`](tofpet_core::OverlappedStage).
//!
#![warn(missing_docs)]

mod calibration;
mod error;
mod geometry;
mod grouper;
pub mod lut;

pub use calibration::{coarse_tot, CalibrationConfig, CalibrationStats, Calibrator};
pub use error::{Error, Result};
pub use geometry::{CrystalGeometry, CrystalPosition, PositionMapper};
pub use grouper::{GroupingConfig, GroupingStats, NaiveGrouper, MAX_TIME_WINDOW_PS};
pub use lut::{CalibrationTable, Edge, EdgeCalibration, EnergyResponse, TacCalibration};
