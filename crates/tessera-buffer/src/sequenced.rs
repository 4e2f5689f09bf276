//! Bounded buffer that numbers its elements.
//!
//! Elements receive consecutive sequence numbers as they are inserted.
//! The oldest elements can be discarded with [`SequencedBuffer::flush_before`];
//! sequence numbers are never reused, so a flushed prefix simply becomes
//! unreachable.

use std::collections::VecDeque;

/// Bounded, append-only buffer with monotonically increasing sequence numbers.
#[derive(Debug, Clone)]
pub struct SequencedBuffer<T> {
    /// Retained elements, `slots[0]` holds `first`.
    slots: VecDeque<T>,
    /// Maximum number of retained elements.
    capacity: usize,
    /// Sequence number of the oldest retained element.
    first: u64,
}

impl<T> SequencedBuffer<T> {
    /// Creates an empty buffer that retains at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
            first: 0,
        }
    }

    /// Returns the maximum number of retained elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of retained elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing is retained.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if another insert would fail.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Sequence number of the oldest retained element.
    #[inline]
    pub fn first_sequence(&self) -> u64 {
        self.first
    }

    /// Sequence number the next insert will receive.
    #[inline]
    pub fn next_sequence(&self) -> u64 {
        self.first + self.slots.len() as u64
    }

    /// Appends an element and returns its sequence number, or `None` when full.
    pub fn insert(&mut self, item: T) -> Option<u64> {
        if self.is_full() {
            return None;
        }
        let seq = self.next_sequence();
        self.slots.push_back(item);
        Some(seq)
    }

    /// Returns the element at `seq` if it is still retained.
    pub fn get(&self, seq: u64) -> Option<&T> {
        if seq < self.first {
            return None;
        }
        self.slots.get((seq - self.first) as usize)
    }

    /// Returns a mutable reference to the element at `seq` if it is still retained.
    pub fn get_mut(&mut self, seq: u64) -> Option<&mut T> {
        if seq < self.first {
            return None;
        }
        self.slots.get_mut((seq - self.first) as usize)
    }

    /// Returns the newest element.
    pub fn last(&self) -> Option<&T> {
        self.slots.back()
    }

    /// Removes and returns the newest element.
    ///
    /// The sequence number it held is handed out again by the next insert.
    pub fn pop_last(&mut self) -> Option<T> {
        self.slots.pop_back()
    }

    /// Discards every element with a sequence below `seq`.
    ///
    /// The boundary is clamped to `next_sequence()`, so flushing never
    /// skips sequence numbers that have not been assigned yet. Returns the
    /// number of elements discarded.
    pub fn flush_before(&mut self, seq: u64) -> usize {
        let boundary = seq.min(self.next_sequence());
        if boundary <= self.first {
            return 0;
        }
        let count = (boundary - self.first) as usize;
        self.slots.drain(..count);
        self.first = boundary;
        count
    }

    /// Discards all elements and restarts numbering at zero.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.first = 0;
    }

    /// Iterates retained elements with their sequence numbers, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, &T)> + '_ {
        let first = self.first;
        self.slots
            .iter()
            .enumerate()
            .map(move |(i, item)| (first + i as u64, item))
    }
}
