//! Lock-free single-producer, multi-consumer ring.
//!
//! The producer never waits: when the ring wraps it overwrites the oldest
//! slot. Each consumer owns its own cursor and learns about overwritten
//! entries through [`ReadOutcome::Lagged`]. Slots carry a stamp equal to
//! `position + 1` once published, which lets readers validate a copy
//! without locking (seqlock style).

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

/// Stamp stored while a slot is being rewritten.
const WRITING: u64 = 0;

struct Slot<T> {
    /// `position + 1` of the value held, or `WRITING`.
    stamp: AtomicU64,
    value: UnsafeCell<T>,
}

/// Shared ring storage.
pub struct SpmcRing<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    /// Next position the producer will write. Every reader polls it, so it
    /// gets a cache line of its own.
    head: CachePadded<AtomicU64>,
}

// SAFETY: slots are written only by the single `Producer` and read by
// consumers through stamp validation; `T: Copy` values never need dropping.
unsafe impl<T: Copy + Send> Sync for SpmcRing<T> {}
unsafe impl<T: Copy + Send> Send for SpmcRing<T> {}

/// Writing half of a ring. Not cloneable, so there is exactly one producer.
pub struct Producer<T> {
    ring: Arc<SpmcRing<T>>,
}

/// Reading half of a ring with a private cursor.
///
/// Cloning a reader yields an independent consumer at the same position.
pub struct Reader<T> {
    ring: Arc<SpmcRing<T>>,
    cursor: u64,
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            cursor: self.cursor,
        }
    }
}

/// Result of a single read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// The next value in order.
    Value(T),
    /// Nothing new has been published.
    Empty,
    /// The producer overwrote entries this reader had not consumed.
    /// The cursor was moved to the oldest value still available.
    Lagged(u64),
}

/// Creates a ring with at least `capacity` slots (rounded up to a power of two).
pub fn spmc_ring<T: Copy + Default>(capacity: usize) -> (Producer<T>, Reader<T>) {
    let size = capacity.max(1).next_power_of_two();
    let slots = (0..size)
        .map(|_| Slot {
            stamp: AtomicU64::new(WRITING),
            value: UnsafeCell::new(T::default()),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(SpmcRing {
        slots,
        mask: size as u64 - 1,
        head: CachePadded::new(AtomicU64::new(0)),
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Reader { ring, cursor: 0 },
    )
}

impl<T> SpmcRing<T> {
    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total number of values ever published.
    #[inline]
    pub fn published(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }
}

impl<T: Copy> Producer<T> {
    /// Publishes a value, overwriting the oldest slot once the ring is full.
    pub fn push(&mut self, value: T) {
        let ring = &*self.ring;
        let pos = ring.head.load(Ordering::Relaxed);
        let slot = &ring.slots[(pos & ring.mask) as usize];

        slot.stamp.store(WRITING, Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: only this producer writes slots; readers validate the
        // stamp before and after copying.
        unsafe { std::ptr::write_volatile(slot.value.get(), value) };
        slot.stamp.store(pos + 1, Ordering::Release);
        ring.head.store(pos + 1, Ordering::Release);
    }

    /// Returns a new reader positioned at the next value to be published.
    pub fn subscribe(&self) -> Reader<T> {
        Reader {
            ring: Arc::clone(&self.ring),
            cursor: self.ring.published(),
        }
    }

    /// Returns the shared ring.
    pub fn ring(&self) -> &SpmcRing<T> {
        &self.ring
    }
}

impl<T: Copy> Reader<T> {
    /// Position of the next value this reader will return.
    #[inline]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Attempts to read the next value without blocking.
    pub fn try_read(&mut self) -> ReadOutcome<T> {
        let ring = &*self.ring;
        let capacity = ring.slots.len() as u64;
        loop {
            let head = ring.head.load(Ordering::Acquire);
            if self.cursor >= head {
                return ReadOutcome::Empty;
            }
            if head - self.cursor > capacity {
                let missed = head - capacity - self.cursor;
                self.cursor = head - capacity;
                return ReadOutcome::Lagged(missed);
            }

            let slot = &ring.slots[(self.cursor & ring.mask) as usize];
            let before = slot.stamp.load(Ordering::Acquire);
            if before != self.cursor + 1 {
                // Overwritten since `head` was loaded; re-evaluate the lag.
                continue;
            }
            // SAFETY: the copy is discarded unless the stamp is unchanged.
            let value = unsafe { std::ptr::read_volatile(slot.value.get()) };
            fence(Ordering::Acquire);
            if slot.stamp.load(Ordering::Relaxed) != before {
                continue;
            }
            self.cursor += 1;
            return ReadOutcome::Value(value);
        }
    }

    /// Reads every value currently available, skipping over any lag.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        loop {
            match self.try_read() {
                ReadOutcome::Value(v) => out.push(v),
                ReadOutcome::Lagged(_) => continue,
                ReadOutcome::Empty => return out,
            }
        }
    }
}
