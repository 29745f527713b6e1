//! tofpet-core: Core buffers, hit types and streaming stages for TOFPET data.
//!
//! This crate provides the event buffer every stage exchanges, the raw and
//! calibrated hit types, the push-based sink contract and the overlapped
//! stage that lets windowed algorithms run over arbitrarily cut streams.
//!

pub mod buffer;
pub mod config;
pub mod error;
pub mod hit;
pub mod photon;
pub mod stage;
pub mod stream;

pub use buffer::EventBuffer;
pub use config::{SystemConfig, FLUSH_MARGIN};
pub use error::{Error, Result};
pub use hit::{FrontEnd, Hit, RawData, RawHit, Timed};
pub use photon::GammaPhoton;
pub use stage::{EventHandler, OverlapMode, OverlappedStage, StageConfig, StageStats};
pub use stream::{spawn_source, CollectingSink, EventSink, NullSink, SinkCall, SourceHandle};
