//! # Circular Queue
//!
//! Zero-copy FIFO over a fixed ring of slots with a two-phase protocol on
//! both ends: a producer *acquires* a slot, fills it in place and then
//! *commits* (or *discards*) it; a consumer *consumes* the oldest committed
//! slot, reads it in place and then *releases* it.
//!
//! ## Ring layout
//!
//! ```text
//!   start_consume      start            end            end_acq
//!        │               │               │                │
//!   ─────┼───────────────┼───────────────┼────────────────┼──────────
//!        │ consumed,     │ committed     │ acquired,      │ free
//!        │ not released  │ (count)       │ not committed  │
//! ```
//!
//! The four ranges always sum to at most `N`, and each cursor only ever
//! moves forward (except `end_acq` on discard).
//!
//! Slots are handed out as owned [`Slot`] / [`Consumed`] tokens. The tokens
//! are not `Clone`, so each acquisition is finished exactly once; finishing
//! them out of FIFO order is fatal.

use log::trace;

use crate::fatal;

/// A slot acquired by the producer, not yet committed or discarded.
#[must_use = "an acquired slot must be committed or discarded"]
#[derive(Debug, PartialEq, Eq)]
pub struct Slot {
    index: usize,
}

impl Slot {
    /// Position of the slot in the ring. Stable for the slot's lifetime.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A slot consumed by the consumer, not yet released.
#[must_use = "a consumed slot must be released"]
#[derive(Debug, PartialEq, Eq)]
pub struct Consumed {
    index: usize,
}

impl Consumed {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }
}

pub struct Queue<T, const N: usize> {
    slots: [T; N],

    start: usize,
    end: usize,
    count: usize,

    end_acq: usize,
    count_acquired: usize,

    start_consume: usize,
    count_consumed: usize,
}

impl<T, const N: usize> Queue<T, N> {
    const NONZERO: () = assert!(N > 0, "queue capacity must be non-zero");

    /// Build a queue over pre-initialized slot storage.
    pub const fn with_slots(slots: [T; N]) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NONZERO;
        Self {
            slots,
            start: 0,
            end: 0,
            count: 0,
            end_acq: 0,
            count_acquired: 0,
            start_consume: 0,
            count_consumed: 0,
        }
    }

    pub fn new() -> Self
    where
        T: Default,
    {
        Self::with_slots(core::array::from_fn(|_| T::default()))
    }

    /// Committed elements waiting to be consumed.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Slots acquired but not yet committed or discarded.
    #[inline]
    pub fn acquired(&self) -> usize {
        self.count_acquired
    }

    /// Slots consumed but not yet released.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.count_consumed
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// No free slot is left.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.count_acquired + self.count + self.count_consumed == N
    }

    // --- Producer ---

    /// Acquire the next free slot.
    ///
    /// On a full queue returns `None`, unless `overwrite` is set and the
    /// oldest slot holds a committed element. That element is then evicted
    /// and its slot returned.
    ///
    /// Overwrite also returns `None` while the consumer holds a consumed slot
    /// that it has not released yet, even if committed elements remain.
    pub fn push_acquire(&mut self, overwrite: bool) -> Option<Slot> {
        trace!(
            "push_acquire: start {}, end {}, end_acq {}",
            self.start,
            self.end,
            self.end_acq
        );

        if self.is_full() {
            if !overwrite || self.count == 0 {
                return None;
            }

            // Evicting is only possible while the oldest slot in the ring is
            // committed; a pending consumed slot would be overtaken otherwise.
            if self.count_consumed != 0 {
                trace!("push_acquire: {} consumed slot(s) pending, nothing evictable", self.count_consumed);
                return None;
            }

            let evicted = self.pop_consume()?;
            self.pop_release(evicted);
        }

        let slot = Slot { index: self.end_acq };
        self.end_acq = Self::next(self.end_acq);
        self.count_acquired += 1;
        Some(slot)
    }

    pub fn slot_mut(&mut self, slot: &Slot) -> &mut T {
        &mut self.slots[slot.index]
    }

    /// Publish the oldest acquired slot.
    pub fn push_commit(&mut self, slot: Slot) {
        trace!(
            "push_commit: start {}, end {}, end_acq {}, slot {}",
            self.start,
            self.end,
            self.end_acq,
            slot.index
        );

        if self.count_acquired == 0 {
            fatal!("no pending acquired element");
        }
        if slot.index != self.end {
            fatal!("attempt to commit element out-of-order (slot {}, expected {})", slot.index, self.end);
        }

        self.end = Self::next(self.end);
        self.count += 1;
        self.count_acquired -= 1;
    }

    /// Return the most recently acquired slot to the free range.
    pub fn push_discard(&mut self, slot: Slot) {
        let prev_end_acq = Self::prev(self.end_acq);
        trace!(
            "push_discard: start {}, end {}, end_acq {}, slot {}",
            self.start,
            self.end,
            self.end_acq,
            slot.index
        );

        if self.count_acquired == 0 {
            fatal!("no pending acquired element");
        }
        if slot.index != prev_end_acq {
            fatal!("attempt to discard element out-of-order (slot {}, expected {})", slot.index, prev_end_acq);
        }

        self.end_acq = prev_end_acq;
        self.count_acquired -= 1;
    }

    // --- Consumer ---

    /// The oldest committed element, without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.count == 0 {
            None
        } else {
            Some(&self.slots[self.start])
        }
    }

    /// Take the oldest committed element into the consumed range.
    pub fn pop_consume(&mut self) -> Option<Consumed> {
        trace!(
            "pop_consume: start {}, end {}, start_consume {}",
            self.start,
            self.end,
            self.start_consume
        );

        if self.count == 0 {
            return None;
        }

        let consumed = Consumed { index: self.start };
        self.start = Self::next(self.start);
        self.count -= 1;
        self.count_consumed += 1;
        Some(consumed)
    }

    pub fn get(&self, consumed: &Consumed) -> &T {
        &self.slots[consumed.index]
    }

    /// Free the oldest consumed slot.
    pub fn pop_release(&mut self, consumed: Consumed) {
        trace!(
            "pop_release: start {}, end {}, start_consume {}, slot {}",
            self.start,
            self.end,
            self.start_consume,
            consumed.index
        );

        if self.count_consumed == 0 {
            fatal!("no pending consumed element");
        }
        if consumed.index != self.start_consume {
            fatal!(
                "attempt to release element out-of-order (slot {}, expected {})",
                consumed.index,
                self.start_consume
            );
        }

        self.start_consume = Self::next(self.start_consume);
        self.count_consumed -= 1;
    }

    #[inline]
    fn next(i: usize) -> usize {
        (i + 1) % N
    }

    #[inline]
    fn prev(i: usize) -> usize {
        (i + N - 1) % N
    }
}

impl<T: Default, const N: usize> Default for Queue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> core::fmt::Debug for Queue<T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &N)
            .field("count", &self.count)
            .field("acquired", &self.count_acquired)
            .field("consumed", &self.count_consumed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn push<const N: usize>(q: &mut Queue<i32, N>, value: i32, overwrite: bool) -> usize {
        let slot = q.push_acquire(overwrite).expect("free slot");
        let index = slot.index();
        *q.slot_mut(&slot) = value;
        q.push_commit(slot);
        index
    }

    fn pop<const N: usize>(q: &mut Queue<i32, N>) -> i32 {
        let consumed = q.pop_consume().expect("committed element");
        let value = *q.get(&consumed);
        q.pop_release(consumed);
        value
    }

    #[test]
    fn test_fifo_order_across_wraparound() {
        let mut q = Queue::<i32, 3>::new();
        for round in 0..4 {
            push(&mut q, round * 10, false);
            push(&mut q, round * 10 + 1, false);
            assert_eq!(q.count(), 2);
            assert_eq!(pop(&mut q), round * 10);
            assert_eq!(pop(&mut q), round * 10 + 1);
        }
        assert_eq!(q.count(), 0);
        assert!(q.pop_consume().is_none());
    }

    #[test]
    fn test_full_without_overwrite() {
        let mut q = Queue::<i32, 2>::new();
        push(&mut q, 1, false);
        let pending = q.push_acquire(false).expect("free slot");
        assert!(q.is_full());
        assert!(q.push_acquire(false).is_none());
        assert_eq!(q.acquired() + q.count() + q.consumed(), q.capacity());
        q.push_discard(pending);
        assert!(!q.is_full());
    }

    #[test]
    fn test_overwrite_evicts_oldest() {
        let mut q = Queue::<i32, 3>::new();
        let first = push(&mut q, 1, true);
        push(&mut q, 2, true);
        push(&mut q, 3, true);
        assert_eq!(q.count(), 3);

        let slot = q.push_acquire(true).expect("evicted slot");
        assert_eq!(slot.index(), first);
        assert_eq!(q.count(), 2);

        *q.slot_mut(&slot) = 5;
        q.push_commit(slot);
        assert_eq!(q.count(), 3);

        assert_eq!(pop(&mut q), 2);
        assert_eq!(pop(&mut q), 3);
        assert_eq!(pop(&mut q), 5);
    }

    #[test]
    fn test_overwrite_with_nothing_committed() {
        let mut q = Queue::<i32, 2>::new();
        let a = q.push_acquire(false).expect("free slot");
        let b = q.push_acquire(false).expect("free slot");
        assert!(q.push_acquire(true).is_none());
        q.push_commit(a);
        q.push_commit(b);

        // The oldest slot is consumed but not released
        let held = q.pop_consume().expect("committed element");
        assert!(q.is_full());
        assert!(q.push_acquire(true).is_none());
        q.pop_release(held);

        let slot = q.push_acquire(false).expect("free slot");
        assert_eq!(slot.index(), 0);
        q.push_discard(slot);
    }

    #[test]
    fn test_overwrite_blocked_by_held_consumer_slot() {
        let mut q = Queue::<i32, 3>::new();
        push(&mut q, 1, true);
        push(&mut q, 2, true);
        push(&mut q, 3, true);

        let held = q.pop_consume().expect("committed element");
        assert_eq!(*q.get(&held), 1);
        assert_eq!(q.count(), 2);
        assert!(q.is_full());
        assert!(q.push_acquire(true).is_none());

        // Releasing frees the slot without evicting anything
        q.pop_release(held);
        push(&mut q, 4, true);
        assert_eq!(pop(&mut q), 2);
        assert_eq!(pop(&mut q), 3);
        assert_eq!(pop(&mut q), 4);
    }

    #[test]
    fn test_discard_reuses_slot() {
        let mut q = Queue::<i32, 4>::new();
        push(&mut q, 7, false);
        let slot = q.push_acquire(false).expect("free slot");
        let index = slot.index();
        q.push_discard(slot);
        assert_eq!(q.count(), 1);
        assert_eq!(q.acquired(), 0);

        let again = q.push_acquire(false).expect("free slot");
        assert_eq!(again.index(), index);
        q.push_commit(again);
        assert_eq!(q.peek(), Some(&7));
    }

    #[test]
    #[should_panic(expected = "attempt to commit element out-of-order")]
    fn test_out_of_order_commit_is_fatal() {
        let mut q = Queue::<i32, 4>::new();
        let first = q.push_acquire(false).expect("free slot");
        let second = q.push_acquire(false).expect("free slot");
        q.push_commit(second);
        q.push_commit(first);
    }

    #[test]
    #[should_panic(expected = "attempt to discard element out-of-order")]
    fn test_out_of_order_discard_is_fatal() {
        let mut q = Queue::<i32, 4>::new();
        let first = q.push_acquire(false).expect("free slot");
        let _second = q.push_acquire(false).expect("free slot");
        q.push_discard(first);
    }

    #[test]
    #[should_panic(expected = "attempt to release element out-of-order")]
    fn test_out_of_order_release_is_fatal() {
        let mut q = Queue::<i32, 4>::new();
        push(&mut q, 1, false);
        push(&mut q, 2, false);
        let _first = q.pop_consume().expect("committed element");
        let second = q.pop_consume().expect("committed element");
        q.pop_release(second);
    }

    #[test]
    #[should_panic(expected = "no pending acquired element")]
    fn test_commit_foreign_slot_is_fatal() {
        let mut other = Queue::<i32, 4>::new();
        let foreign = other.push_acquire(false).expect("free slot");
        let mut q = Queue::<i32, 4>::new();
        q.push_commit(foreign);
    }
}
