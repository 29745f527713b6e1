//! Reusable event batches with an authoritative time window.
//!
//! An [`EventBuffer`] is filled by exactly one producer through the
//! write-slot protocol and then handed downstream by value. Its
//! `[t_min, t_max)` window states which absolute times this buffer is the
//! authority for: across a whole stream every time belongs to exactly one
//! buffer, which is what lets overlapped stages emit each event once.

use crate::hit::Timed;

/// A batch of homogeneous records with a half-open validity window.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBuffer<T> {
    records: Vec<T>,
    size: usize,
    capacity: usize,
    t_min: i64,
    t_max: i64,
}

impl<T> EventBuffer<T> {
    /// Creates an empty buffer with the given capacity and an empty window.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            size: 0,
            capacity,
            t_min: 0,
            t_max: 0,
        }
    }

    /// Wraps already committed records.
    #[must_use]
    pub fn from_records(records: Vec<T>, t_min: i64, t_max: i64) -> Self {
        let size = records.len();
        Self {
            capacity: size,
            records,
            size,
            t_min,
            t_max,
        }
    }

    /// Capacity requested at construction.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of committed records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Returns true if no record has been committed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns true once the committed records reach the capacity.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    /// Commits the slot returned by the last [`write_slot`](Self::write_slot) call.
    ///
    /// Calling this without a pending slot is a no-op.
    #[inline]
    pub fn push_write_slot(&mut self) {
        if self.size < self.records.len() {
            self.size += 1;
        }
    }

    /// Appends a committed record.
    #[inline]
    pub fn push(&mut self, record: T) {
        self.records.truncate(self.size);
        self.records.push(record);
        self.size += 1;
    }

    /// Committed record at `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    /// Committed records.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.records[..self.size]
    }

    /// Iterator over committed records.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Consumes the buffer, returning the committed records.
    #[must_use]
    pub fn into_records(mut self) -> Vec<T> {
        self.records.truncate(self.size);
        self.records
    }

    /// Lower (inclusive) bound of the authoritative window.
    #[inline]
    #[must_use]
    pub fn t_min(&self) -> i64 {
        self.t_min
    }

    /// Upper (exclusive) bound of the authoritative window.
    #[inline]
    #[must_use]
    pub fn t_max(&self) -> i64 {
        self.t_max
    }

    /// Sets the lower bound of the window.
    #[inline]
    pub fn set_t_min(&mut self, t_min: i64) {
        self.t_min = t_min;
    }

    /// Sets the upper bound of the window.
    #[inline]
    pub fn set_t_max(&mut self, t_max: i64) {
        self.t_max = t_max;
    }

    /// Sets both window bounds.
    #[inline]
    pub fn set_window(&mut self, t_min: i64, t_max: i64) {
        self.t_min = t_min;
        self.t_max = t_max;
    }

    /// True if `time` falls inside `[t_min, t_max)`.
    #[inline]
    #[must_use]
    pub fn contains_time(&self, time: i64) -> bool {
        time >= self.t_min && time < self.t_max
    }
}

impl<T: Default> EventBuffer<T> {
    /// Returns the next uncommitted record, reset to its default value.
    ///
    /// The slot stays invisible to readers until
    /// [`push_write_slot`](Self::push_write_slot) is called, so a producer can
    /// fill it speculatively and abandon it by simply not committing.
    pub fn write_slot(&mut self) -> &mut T {
        if self.records.len() > self.size {
            self.records[self.size] = T::default();
        } else {
            self.records.push(T::default());
        }
        &mut self.records[self.size]
    }
}

impl<T: Timed> EventBuffer<T> {
    /// Committed records whose time lies inside the window.
    pub fn iter_in_window(&self) -> impl Iterator<Item = &T> {
        self.iter().filter(|record| self.contains_time(record.time()))
    }
}

impl<'a, T> IntoIterator for &'a EventBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hit::RawHit;

    #[test]
    fn test_write_slot_commit() {
        let mut buffer: EventBuffer<u32> = EventBuffer::new(4);
        assert!(buffer.is_empty());

        *buffer.write_slot() = 7;
        assert_eq!(buffer.len(), 0, "uncommitted slot must be invisible");
        buffer.push_write_slot();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(0), Some(&7));
    }

    #[test]
    fn test_abandoned_slot_is_reused() {
        let mut buffer: EventBuffer<u32> = EventBuffer::new(4);
        *buffer.write_slot() = 1;
        buffer.push_write_slot();

        // Speculative write that is rejected.
        *buffer.write_slot() = 99;
        // Next slot starts from the default again.
        assert_eq!(*buffer.write_slot(), 0);
        *buffer.write_slot() = 2;
        buffer.push_write_slot();

        assert_eq!(buffer.as_slice(), &[1, 2]);
        assert_eq!(buffer.clone().into_records(), vec![1, 2]);
    }

    #[test]
    fn test_push_write_slot_without_slot_is_noop() {
        let mut buffer: EventBuffer<u32> = EventBuffer::new(2);
        buffer.push_write_slot();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_and_full() {
        let mut buffer: EventBuffer<u8> = EventBuffer::new(2);
        buffer.push(1);
        assert!(!buffer.is_full());
        buffer.push(2);
        assert!(buffer.is_full());
        assert_eq!(buffer.capacity(), 2);
    }

    #[test]
    fn test_window_is_half_open() {
        let mut buffer: EventBuffer<RawHit> = EventBuffer::new(3);
        buffer.set_window(100, 200);
        for time in [99, 100, 199, 200] {
            buffer.push(RawHit {
                time,
                ..RawHit::default()
            });
        }
        let inside: Vec<i64> = buffer.iter_in_window().map(|h| h.time).collect();
        assert_eq!(inside, vec![100, 199]);
    }
}
