//! Fixed-slot circular buffer used as the hand-off primitive between pipeline
//! stages.
//!
//! Slots are pre-allocated at construction and never resized. Two monotonic
//! counters (`head` for the next write, `tail` for the next read) are each
//! serialized by their own lock; the payload of a slot is protected by that
//! slot's own mutex, held only for the duration of a single read or write.
//! Separating "claim a slot index" from "own this slot's contents" lets the
//! producer and consumer proceed concurrently on different slots while index
//! bookkeeping stays serialized.
//!
//! The last [`GUARD_SLOTS`] slots are a guard band: filling past it is a hard
//! [`RingError::Overrun`], not backpressure. An overrun means the capacity or
//! the downstream stage is misconfigured and must be surfaced, never retried
//! through silently.

use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use thiserror::Error;

/// Slots held in reserve between the write head and the read tail
pub const GUARD_SLOTS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("overran circular buffer: {pending} of {capacity} slots pending")]
    Overrun { pending: u64, capacity: usize },
}

pub struct RingBuffer<T> {
    slots: Vec<Mutex<T>>,
    head: AtomicU64,
    tail: AtomicU64,
    append: Mutex<()>,
    retrieve: Mutex<()>,
}

/// Exclusive access to one slot's payload. Index bookkeeping has already
/// advanced by the time a guard exists; dropping it releases the slot.
#[derive(Debug)]
pub struct SlotGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for SlotGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SlotGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// A poisoned slot just means a holder panicked mid-access; the payload is
// still structurally valid for our fixed-size types, so keep going.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T> RingBuffer<T> {
    /// Pre-allocate `capacity` slots, each initialized with `init`
    pub fn new(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        assert!(
            capacity as u64 > GUARD_SLOTS,
            "ring capacity must exceed the {GUARD_SLOTS}-slot guard band"
        );
        Self {
            slots: (0..capacity).map(|_| Mutex::new(init())).collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            append: Mutex::new(()),
            retrieve: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the next slot for writing. The caller fills the slot through the
    /// guard and drops it to hand the slot to the reader side.
    pub fn acquire_write(&self) -> Result<SlotGuard<'_, T>, RingError> {
        let _append = lock(&self.append);
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let pending = head - tail;
        if pending >= self.slots.len() as u64 - GUARD_SLOTS {
            return Err(RingError::Overrun {
                pending,
                capacity: self.slots.len(),
            });
        }
        // Take the slot lock before publishing the new head, so a reader that
        // sees the advanced head always blocks until the payload is written.
        let guard = lock(&self.slots[(head % self.slots.len() as u64) as usize]);
        self.head.store(head + 1, Ordering::Release);
        Ok(SlotGuard { guard })
    }

    /// Claim the oldest unread slot, or `None` if the buffer is empty. This is
    /// a poll, not a wait.
    pub fn acquire_read(&self) -> Option<SlotGuard<'_, T>> {
        let _retrieve = lock(&self.retrieve);
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let guard = lock(&self.slots[(tail % self.slots.len() as u64) as usize]);
        self.tail.store(tail + 1, Ordering::Release);
        Some(SlotGuard { guard })
    }

    /// Unread slot count. Racy by construction; for logging only, never
    /// control flow.
    pub fn pending(&self) -> u64 {
        self.head
            .load(Ordering::Relaxed)
            .saturating_sub(self.tail.load(Ordering::Relaxed))
    }
}
