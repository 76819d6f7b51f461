//! Fixed-capacity FIFO with monotonic positions.
//!
//! Every entry ever written gets a position (`0, 1, 2, ...`). Positions keep
//! counting across eviction and [`RingBuffer::clear`], so a reader can hold a
//! [`BufferCursor`] and later ask for "everything since" without coordinating
//! with writers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A read position in a [`RingBuffer`]. `position` is the total number of
/// entries the reader has already seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferCursor {
    pub position: u64,
}

impl BufferCursor {
    pub const START: BufferCursor = BufferCursor { position: 0 };

    pub fn at(position: u64) -> Self {
        Self { position }
    }
}

#[derive(Debug, Clone)]
struct Slot<T> {
    added_at: DateTime<Utc>,
    value: T,
}

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: VecDeque<Slot<T>>,
    capacity: usize,
    total_added: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be > 0");
        Self {
            slots: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            total_added: 0,
        }
    }

    /// Appends entries, evicting the oldest once full. Returns the number written.
    pub fn write(&mut self, entries: impl IntoIterator<Item = T>) -> usize {
        self.write_at(entries, Utc::now())
    }

    pub fn write_at(&mut self, entries: impl IntoIterator<Item = T>, now: DateTime<Utc>) -> usize {
        let mut written = 0;
        for value in entries {
            self.push(value, now);
            written += 1;
        }
        written
    }

    /// Appends one entry and hands back whatever it evicted.
    pub fn push(&mut self, value: T, now: DateTime<Utc>) -> Option<T> {
        let evicted = if self.slots.len() == self.capacity {
            self.slots.pop_front().map(|slot| slot.value)
        } else {
            None
        };
        self.slots.push_back(Slot {
            added_at: now,
            value,
        });
        self.total_added += 1;
        evicted
    }

    /// Drops the oldest retained entry (memory-budget eviction).
    pub fn pop_oldest(&mut self) -> Option<T> {
        self.slots.pop_front().map(|slot| slot.value)
    }

    /// Drops entries while `pred` holds for the oldest one. Returns how many went.
    pub fn evict_while(&mut self, mut pred: impl FnMut(&T, DateTime<Utc>) -> bool) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.slots.front() {
            if !pred(&front.value, front.added_at) {
                break;
            }
            self.slots.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Empties the buffer. Positions are preserved so outstanding cursors stay valid.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Total entries ever written; the position the next write will get.
    pub fn current_position(&self) -> u64 {
        self.total_added
    }

    /// Position of the oldest retained entry.
    pub fn oldest_position(&self) -> u64 {
        self.total_added - self.slots.len() as u64
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.slots.iter().map(|slot| &slot.value)
    }

    /// Entries with their wall-clock insertion time, oldest first.
    pub fn iter_with_time(&self) -> impl DoubleEndedIterator<Item = (&T, DateTime<Utc>)> {
        self.slots.iter().map(|slot| (&slot.value, slot.added_at))
    }

    pub fn newest_added_at(&self) -> Option<DateTime<Utc>> {
        self.slots.back().map(|slot| slot.added_at)
    }

    /// Smallest retained position whose insertion time is at or after `t`.
    /// `-1` when the buffer is empty or every retained entry predates `t`.
    pub fn find_position_at_time(&self, t: DateTime<Utc>) -> i64 {
        let oldest = self.oldest_position();
        // Insertion times are non-decreasing, so the first match wins.
        let idx = self.slots.partition_point(|slot| slot.added_at < t);
        if idx == self.slots.len() {
            -1
        } else {
            (oldest + idx as u64) as i64
        }
    }

    /// Clamps a cursor into the retained window; returns the slot index to start at.
    fn start_index(&self, cursor: BufferCursor) -> Option<usize> {
        let oldest = self.oldest_position();
        let start = cursor.position.max(oldest);
        if start >= self.total_added {
            return None;
        }
        Some((start - oldest) as usize)
    }
}

impl<T: Clone> RingBuffer<T> {
    /// All retained entries, oldest first.
    pub fn read_all(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }

    /// The last `min(n, len)` entries, oldest first.
    pub fn read_last(&self, n: usize) -> Vec<T> {
        let skip = self.slots.len().saturating_sub(n);
        self.iter().skip(skip).cloned().collect()
    }

    /// Entries written since `cursor`. Positions already evicted are skipped;
    /// a cursor at or past the head yields nothing and keeps its position.
    pub fn read_from(&self, cursor: BufferCursor) -> (Vec<T>, BufferCursor) {
        match self.start_index(cursor) {
            None => (
                Vec::new(),
                BufferCursor::at(cursor.position.max(self.total_added)),
            ),
            Some(start) => (
                self.iter().skip(start).cloned().collect(),
                BufferCursor::at(self.total_added),
            ),
        }
    }

    /// Like [`RingBuffer::read_from`] but only keeps entries matching `pred`.
    /// With `limit > 0` the scan stops after that many matches and the
    /// returned cursor points just past the last match, so the next call
    /// resumes where this one stopped.
    pub fn read_from_with_filter(
        &self,
        cursor: BufferCursor,
        mut pred: impl FnMut(&T) -> bool,
        limit: usize,
    ) -> (Vec<T>, BufferCursor) {
        let Some(start) = self.start_index(cursor) else {
            return self.read_from(cursor);
        };
        let oldest = self.oldest_position();
        let mut out = Vec::new();
        for (idx, value) in self.iter().enumerate().skip(start) {
            if !pred(value) {
                continue;
            }
            out.push(value.clone());
            if limit > 0 && out.len() >= limit {
                let next = oldest + idx as u64 + 1;
                return (out, BufferCursor::at(next));
            }
        }
        (out, BufferCursor::at(self.total_added))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cursor_tail() {
        let mut ring = RingBuffer::new(100);
        ring.write([1, 2, 3]);
        let (entries, cursor) = ring.read_from(BufferCursor::at(0));
        assert_eq!(entries, vec![1, 2, 3]);
        assert_eq!(cursor, BufferCursor::at(3));

        ring.write([4, 5]);
        let (entries, cursor) = ring.read_from(BufferCursor::at(3));
        assert_eq!(entries, vec![4, 5]);
        assert_eq!(cursor, BufferCursor::at(5));

        let (entries, cursor) = ring.read_from(BufferCursor::at(5));
        assert!(entries.is_empty());
        assert_eq!(cursor, BufferCursor::at(5));
    }

    #[test]
    fn eviction_tail() {
        let mut ring = RingBuffer::new(3);
        ring.write([1, 2, 3, 4, 5]);
        assert_eq!(ring.read_all(), vec![3, 4, 5]);
        let (entries, cursor) = ring.read_from(BufferCursor::at(0));
        assert_eq!(entries, vec![3, 4, 5]);
        assert_eq!(cursor, BufferCursor::at(5));
    }

    #[test]
    fn position_counts_every_append_and_survives_clear() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.write(Vec::<u32>::new()), 0);
        for batch in [vec![1, 2], vec![3], vec![4, 5, 6, 7, 8]] {
            ring.write(batch);
        }
        assert_eq!(ring.current_position(), 8);
        assert_eq!(ring.len(), 4);

        ring.clear();
        assert_eq!(ring.current_position(), 8);
        assert_eq!(ring.len(), 0);

        let (entries, cursor) = ring.read_from(BufferCursor::at(2));
        assert!(entries.is_empty());
        assert_eq!(cursor, BufferCursor::at(8));

        ring.write([9]);
        let (entries, cursor) = ring.read_from(cursor);
        assert_eq!(entries, vec![9]);
        assert_eq!(cursor, BufferCursor::at(9));
    }

    #[test]
    fn consecutive_reads_without_writes_return_nothing_new() {
        let mut ring = RingBuffer::new(10);
        ring.write(0..7);
        let (_, cursor) = ring.read_from(BufferCursor::START);
        let (again, same) = ring.read_from(cursor);
        assert!(again.is_empty());
        assert_eq!(same, cursor);
    }

    #[test]
    fn read_last_clamps_to_len() {
        let mut ring = RingBuffer::new(5);
        ring.write(1..=3);
        assert_eq!(ring.read_last(0), Vec::<i32>::new());
        assert_eq!(ring.read_last(2), vec![2, 3]);
        assert_eq!(ring.read_last(99), vec![1, 2, 3]);
    }

    #[test]
    fn filtered_read_resumes_after_limit() {
        let mut ring = RingBuffer::new(20);
        ring.write(1..=10);
        let (evens, cursor) = ring.read_from_with_filter(BufferCursor::START, |n| n % 2 == 0, 2);
        assert_eq!(evens, vec![2, 4]);
        assert_eq!(cursor, BufferCursor::at(4));

        let (rest, cursor) = ring.read_from_with_filter(cursor, |n| n % 2 == 0, 0);
        assert_eq!(rest, vec![6, 8, 10]);
        assert_eq!(cursor, BufferCursor::at(10));
    }

    #[test]
    fn find_position_at_time_after_eviction() {
        let base = Utc::now();
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i, base + Duration::seconds(i));
        }
        // Retained: positions 2, 3, 4 at base+2s .. base+4s.
        assert_eq!(ring.find_position_at_time(base), 2);
        assert_eq!(ring.find_position_at_time(base + Duration::seconds(3)), 3);
        assert_eq!(
            ring.find_position_at_time(base + Duration::milliseconds(3500)),
            4
        );
        assert_eq!(ring.find_position_at_time(base + Duration::seconds(10)), -1);
        assert_eq!(RingBuffer::<u8>::new(1).find_position_at_time(base), -1);
    }
}
