//! Overlapped processing stages.
//!
//! A stage turns a stream of `EventBuffer<I>` into a stream of
//! `EventBuffer<O>` by running an [`EventHandler`] on each buffer. Handlers
//! that need neighbouring records (grouping) run in windowed mode: every
//! chunk they see carries the trailing `overlap` of the previous input and
//! the leading `overlap` of the following input, while its window stays that
//! of the buffer being processed. A buffer is held back until input reaching
//! `overlap` past its window has arrived. A handler that only emits records anchored inside
//! the window therefore emits each result exactly once, wherever the
//! upstream buffer boundaries fall.
//!
//! Records moved outside their buffer by an earlier stage (a calibration
//! offset) are still covered: the first chunk's window is lowered to its
//! earliest record and the last chunk's window is raised past its latest.

use crate::buffer::EventBuffer;
use crate::hit::Timed;
use crate::stream::EventSink;
use crate::{Error, Result};
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-buffer worker of an [`OverlappedStage`].
///
/// `handle_events` receives a chunk whose `[t_min, t_max)` window is
/// authoritative and must only emit records whose anchor time lies inside it.
/// The returned buffer should carry the same window.
pub trait EventHandler: Send + Sync {
    /// Record type consumed.
    type Input: Timed + Clone + Send + Sync;
    /// Record type produced.
    type Output: Send;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Processes one chunk.
    fn handle_events(&self, chunk: &EventBuffer<Self::Input>) -> EventBuffer<Self::Output>;

    /// Logs handler specific statistics.
    fn report(&self);
}

/// How a stage cuts its input into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlapMode {
    /// Every buffer is processed on its own.
    PerRecord,
    /// Chunks are extended by `overlap_ps` of look-back and look-ahead.
    Windowed {
        /// Overlap in picoseconds.
        overlap_ps: i64,
    },
}

/// Stage scheduling parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageConfig {
    /// Chunking mode.
    pub mode: OverlapMode,
    /// Number of chunks processed concurrently.
    pub parallelism: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            mode: OverlapMode::PerRecord,
            parallelism: 1,
        }
    }
}

impl StageConfig {
    /// Per-record stage with no concurrency.
    #[must_use]
    pub fn per_record() -> Self {
        Self::default()
    }

    /// Windowed stage with the given overlap.
    #[must_use]
    pub fn windowed(overlap_ps: i64) -> Self {
        Self {
            mode: OverlapMode::Windowed { overlap_ps },
            parallelism: 1,
        }
    }

    /// Set the number of chunks processed concurrently.
    ///
    /// Values less than 1 are clamped to 1.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Overlap in picoseconds, zero in per-record mode.
    #[must_use]
    pub fn overlap_ps(&self) -> i64 {
        match self.mode {
            OverlapMode::PerRecord => 0,
            OverlapMode::Windowed { overlap_ps } => overlap_ps,
        }
    }
}

/// Snapshot of stage counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageStats {
    pub buffers_in: u64,
    pub records_in: u64,
    pub buffers_out: u64,
    pub records_out: u64,
}

#[derive(Debug, Default)]
struct AtomicStageStats {
    buffers_in: AtomicU64,
    records_in: AtomicU64,
    buffers_out: AtomicU64,
    records_out: AtomicU64,
}

impl AtomicStageStats {
    fn snapshot(&self) -> StageStats {
        StageStats {
            buffers_in: self.buffers_in.load(Ordering::Relaxed),
            records_in: self.records_in.load(Ordering::Relaxed),
            buffers_out: self.buffers_out.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
        }
    }
}

/// An [`EventSink`] that runs a handler and forwards its output to `sink`.
pub struct OverlappedStage<H: EventHandler, S> {
    handler: H,
    sink: S,
    config: StageConfig,
    tail: Vec<H::Input>,
    pending: VecDeque<EventBuffer<H::Input>>,
    ready: Vec<EventBuffer<H::Input>>,
    started: bool,
    stats: AtomicStageStats,
}

impl<H, S> OverlappedStage<H, S>
where
    H: EventHandler,
    S: EventSink<H::Output>,
{
    /// Creates a stage.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for a negative overlap.
    pub fn new(handler: H, config: StageConfig, sink: S) -> Result<Self> {
        if config.overlap_ps() < 0 {
            return Err(Error::ConfigError(format!(
                "overlap must not be negative, got {} ps",
                config.overlap_ps()
            )));
        }
        Ok(Self {
            handler,
            sink,
            config: StageConfig {
                parallelism: config.parallelism.max(1),
                ..config
            },
            tail: Vec::new(),
            pending: VecDeque::new(),
            ready: Vec::new(),
            started: false,
            stats: AtomicStageStats::default(),
        })
    }

    /// The wrapped handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The downstream sink.
    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Current stage counters.
    #[must_use]
    pub fn stats(&self) -> StageStats {
        self.stats.snapshot()
    }

    /// Consumes the stage and returns the downstream sink.
    ///
    /// Records still held for look-ahead are dropped; call `finish` first.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Builds the chunk for the oldest pending buffer, extended by the head
    /// of the buffers that follow it. `last` marks the final buffer of the
    /// stream.
    fn build_chunk(&mut self, current: EventBuffer<H::Input>, last: bool) -> EventBuffer<H::Input> {
        let overlap = self.config.overlap_ps();
        let (mut t_min, t_max) = (current.t_min(), current.t_max());
        if !self.started {
            self.started = true;
            if let Some(earliest) = current.iter().map(Timed::time).min() {
                t_min = t_min.min(earliest);
            }
        }

        let mut records = std::mem::take(&mut self.tail);
        records.extend(current.into_records());

        let keep_from = t_max.saturating_sub(overlap);
        self.tail = records
            .iter()
            .filter(|record| record.time() >= keep_from)
            .cloned()
            .collect();

        let until = t_max.saturating_add(overlap);
        for next in &self.pending {
            records.extend(next.iter().filter(|r| r.time() < until).cloned());
        }

        let t_max = if last {
            records
                .iter()
                .map(|r| r.time().saturating_add(1))
                .fold(t_max, i64::max)
        } else {
            t_max
        };
        EventBuffer::from_records(records, t_min, t_max)
    }

    fn flush_ready(&mut self) -> Result<()> {
        if self.ready.is_empty() {
            return Ok(());
        }
        let chunks = std::mem::take(&mut self.ready);
        let handler = &self.handler;
        let outputs: Vec<EventBuffer<H::Output>> = if chunks.len() == 1 {
            chunks.iter().map(|c| handler.handle_events(c)).collect()
        } else {
            chunks.par_iter().map(|c| handler.handle_events(c)).collect()
        };

        for output in outputs {
            self.stats.buffers_out.fetch_add(1, Ordering::Relaxed);
            self.stats
                .records_out
                .fetch_add(output.len() as u64, Ordering::Relaxed);
            log::debug!(
                "{}: emitting {} records in [{}, {})",
                self.handler.name(),
                output.len(),
                output.t_min(),
                output.t_max()
            );
            self.sink.push_events(output)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, chunk: EventBuffer<H::Input>) -> Result<()> {
        self.ready.push(chunk);
        if self.ready.len() >= self.config.parallelism {
            self.flush_ready()?;
        }
        Ok(())
    }
}

impl<H, S> EventSink<H::Input> for OverlappedStage<H, S>
where
    H: EventHandler,
    S: EventSink<H::Output>,
{
    fn push_t0(&mut self, t0: f64) {
        self.sink.push_t0(t0);
    }

    fn push_events(&mut self, buffer: EventBuffer<H::Input>) -> Result<()> {
        self.stats.buffers_in.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_in
            .fetch_add(buffer.len() as u64, Ordering::Relaxed);

        match self.config.mode {
            OverlapMode::PerRecord => self.enqueue(buffer),
            OverlapMode::Windowed { overlap_ps } => {
                let reached = buffer.t_max();
                self.pending.push_back(buffer);
                while let Some(front) = self.pending.front() {
                    if reached < front.t_max().saturating_add(overlap_ps) {
                        break;
                    }
                    let Some(current) = self.pending.pop_front() else {
                        break;
                    };
                    let chunk = self.build_chunk(current, false);
                    self.enqueue(chunk)?;
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        while let Some(current) = self.pending.pop_front() {
            let last = self.pending.is_empty();
            let chunk = self.build_chunk(current, last);
            self.ready.push(chunk);
        }
        self.flush_ready()?;
        self.tail.clear();
        self.started = false;
        self.sink.finish()
    }

    fn report(&self) {
        self.handler.report();
        let stats = self.stats.snapshot();
        log::info!(
            "{}: {} buffers / {} records in, {} buffers / {} records out",
            self.handler.name(),
            stats.buffers_in,
            stats.records_in,
            stats.buffers_out,
            stats.records_out
        );
        self.sink.report();
    }
}
