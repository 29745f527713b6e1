//! Push-based streaming contract between sources, stages and sinks.
//!
//! A source calls, in this order and exactly once each except for the middle
//! step: [`EventSink::push_t0`], [`EventSink::push_events`] zero or more
//! times, [`EventSink::finish`], [`EventSink::report`]. Buffers arrive in
//! non-decreasing time order. Stages forward every call downstream after
//! doing their own part of it.

use crate::buffer::EventBuffer;
use crate::{Error, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Consumer of a stream of event buffers.
pub trait EventSink<T>: Send {
    /// Announces the acquisition start time. Called once, before any buffer.
    fn push_t0(&mut self, t0: f64);

    /// Hands a buffer downstream. Ownership moves to the sink.
    ///
    /// # Errors
    /// Returns an error if the sink or anything downstream of it failed.
    fn push_events(&mut self, buffer: EventBuffer<T>) -> Result<()>;

    /// Flushes state held across buffers. Called once, after the last buffer.
    ///
    /// # Errors
    /// Returns an error if the final flush failed.
    fn finish(&mut self) -> Result<()>;

    /// Logs accumulated statistics. Called once, after `finish`.
    fn report(&self);
}

impl<T, S: EventSink<T> + ?Sized> EventSink<T> for Box<S> {
    fn push_t0(&mut self, t0: f64) {
        (**self).push_t0(t0);
    }

    fn push_events(&mut self, buffer: EventBuffer<T>) -> Result<()> {
        (**self).push_events(buffer)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }

    fn report(&self) {
        (**self).report();
    }
}

/// A running producer thread.
///
/// The thread owns its sink chain; [`wait`](Self::wait) joins it and returns
/// whatever the production loop returned.
#[derive(Debug)]
pub struct SourceHandle<R> {
    name: String,
    handle: JoinHandle<Result<R>>,
}

impl<R> SourceHandle<R> {
    /// Name the producer thread was started with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the producer has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the producer returns.
    ///
    /// # Errors
    /// Returns the producer's error, or [`Error::SourcePanicked`] if it panicked.
    pub fn wait(self) -> Result<R> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(Error::SourcePanicked(self.name)),
        }
    }
}

/// Starts a named producer thread running `body`.
///
/// # Errors
/// Returns [`Error::Spawn`] if the OS refused to create the thread.
pub fn spawn_source<R, F>(name: impl Into<String>, body: F) -> Result<SourceHandle<R>>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let name = name.into();
    let handle = std::thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| Error::Spawn {
            name: name.clone(),
            source,
        })?;
    log::debug!("started source thread '{name}'");
    Ok(SourceHandle { name, handle })
}

/// One observed call on a [`CollectingSink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkCall {
    /// `push_t0` with its argument.
    T0(f64),
    /// `push_events` with the buffer length.
    Events(usize),
    /// `finish`.
    Finish,
    /// `report`.
    Report,
}

/// Everything a [`CollectingSink`] has seen.
#[derive(Debug)]
pub struct Collected<T> {
    /// Calls in the order they happened.
    pub calls: Vec<SinkCall>,
    /// Buffers in the order they were pushed.
    pub buffers: Vec<EventBuffer<T>>,
}

impl<T> Default for Collected<T> {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            buffers: Vec::new(),
        }
    }
}

impl<T: Clone> Collected<T> {
    /// All records of all buffers, concatenated.
    #[must_use]
    pub fn records(&self) -> Vec<T> {
        self.buffers
            .iter()
            .flat_map(|buffer| buffer.iter().cloned())
            .collect()
    }
}

/// Sink that keeps every buffer and call for later inspection.
///
/// Cloning the sink shares the underlying log, so a test can keep one clone
/// while the pipeline owns the other.
#[derive(Debug)]
pub struct CollectingSink<T> {
    inner: Arc<Mutex<Collected<T>>>,
}

impl<T> Clone for CollectingSink<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for CollectingSink<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collected::default())),
        }
    }
}

impl<T> CollectingSink<T> {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the collected state.
    pub fn with<F, U>(&self, f: F) -> U
    where
        F: FnOnce(&Collected<T>) -> U,
    {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Calls observed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<SinkCall> {
        self.with(|c| c.calls.clone())
    }

    /// Number of buffers observed so far.
    #[must_use]
    pub fn n_buffers(&self) -> usize {
        self.with(|c| c.buffers.len())
    }

    /// Window of every buffer observed so far.
    #[must_use]
    pub fn windows(&self) -> Vec<(i64, i64)> {
        self.with(|c| c.buffers.iter().map(|b| (b.t_min(), b.t_max())).collect())
    }

    fn record(&self, call: SinkCall, buffer: Option<EventBuffer<T>>) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.calls.push(call);
        if let Some(buffer) = buffer {
            guard.buffers.push(buffer);
        }
    }
}

impl<T: Clone> CollectingSink<T> {
    /// All records received so far, in arrival order.
    #[must_use]
    pub fn records(&self) -> Vec<T> {
        self.with(Collected::records)
    }
}

impl<T: Send> EventSink<T> for CollectingSink<T> {
    fn push_t0(&mut self, t0: f64) {
        self.record(SinkCall::T0(t0), None);
    }

    fn push_events(&mut self, buffer: EventBuffer<T>) -> Result<()> {
        self.record(SinkCall::Events(buffer.len()), Some(buffer));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.record(SinkCall::Finish, None);
        Ok(())
    }

    fn report(&self) {
        self.record(SinkCall::Report, None);
    }
}

/// Sink that drops everything it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl<T> EventSink<T> for NullSink {
    fn push_t0(&mut self, _t0: f64) {}

    fn push_events(&mut self, _buffer: EventBuffer<T>) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn report(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_shares_log() {
        let probe: CollectingSink<u32> = CollectingSink::new();
        let mut sink = probe.clone();

        sink.push_t0(0.0);
        sink.push_events(EventBuffer::from_records(vec![1, 2], 0, 10))
            .unwrap();
        sink.finish().unwrap();
        sink.report();

        assert_eq!(
            probe.calls(),
            vec![
                SinkCall::T0(0.0),
                SinkCall::Events(2),
                SinkCall::Finish,
                SinkCall::Report
            ]
        );
        assert_eq!(probe.records(), vec![1, 2]);
        assert_eq!(probe.windows(), vec![(0, 10)]);
    }

    #[test]
    fn test_boxed_sink_forwards() {
        let probe: CollectingSink<u8> = CollectingSink::new();
        let mut boxed: Box<dyn EventSink<u8>> = Box::new(probe.clone());
        boxed.push_events(EventBuffer::new(1)).unwrap();
        assert_eq!(probe.n_buffers(), 1);
    }

    #[test]
    fn test_source_returns_result() {
        let handle = spawn_source("counter", || Ok(42_u64)).unwrap();
        assert_eq!(handle.name(), "counter");
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn test_source_panic_is_reported() {
        let handle = spawn_source::<(), _>("doomed", || panic!("boom")).unwrap();
        match handle.wait() {
            Err(Error::SourcePanicked(name)) => assert_eq!(name, "doomed"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
