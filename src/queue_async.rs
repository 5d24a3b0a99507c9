//! # Async Queue
//!
//! Single-producer single-consumer wrapper around [`Queue`] whose acquire
//! operations suspend the calling task instead of failing.
//!
//! ```text
//!   producer                                   consumer
//!   push_acquire_async ──(full)──► wait not_full
//!                                              pop_release_async ──► fire not_full
//!   push_acquire_resumed ◄── resumed
//!   push_commit_async ──► fire not_empty
//!                                              pop_consume_async ──(ok)──► Ready
//! ```
//!
//! A wakeup guarantees the condition held when the signal fired, and the
//! single-producer/single-consumer discipline guarantees nobody took it
//! away in between. The retry after resuming is therefore expected to
//! succeed, and a failure there is fatal.

use crate::fatal;
use crate::kernel::{Kernel, TaskCx};
use crate::queue::{Consumed, Queue, Slot};
use crate::signal::SignalId;
use crate::task::{Label, Step, TaskId};

/// Result of an acquire that may suspend.
#[derive(Debug)]
pub enum Acquire<T> {
    /// Obtained without waiting.
    Ready(T),
    /// The task is now waiting; return this step from the body and call the
    /// matching `*_resumed` method on the next resume.
    Suspended(Step),
}

pub struct AsyncQueue<T, const N: usize> {
    queue: Queue<T, N>,
    not_full: SignalId,
    not_empty: SignalId,
    producer: Option<TaskId>,
    consumer: Option<TaskId>,
}

impl<T, const N: usize> AsyncQueue<T, N> {
    /// Allocate the queue's two signals from `kernel`.
    pub fn new<W>(kernel: &mut Kernel<W>) -> Self
    where
        T: Default,
    {
        Self::with_queue(kernel, Queue::new())
    }

    pub fn with_queue<W>(kernel: &mut Kernel<W>, queue: Queue<T, N>) -> Self {
        let not_full = kernel.new_signal();
        let not_empty = kernel.new_signal();
        kernel.fire(not_full);

        Self {
            queue,
            not_full,
            not_empty,
            producer: None,
            consumer: None,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.queue.count()
    }

    pub fn slot_mut(&mut self, slot: &Slot) -> &mut T {
        self.queue.slot_mut(slot)
    }

    pub fn get(&self, consumed: &Consumed) -> &T {
        self.queue.get(consumed)
    }

    pub fn peek(&self) -> Option<&T> {
        self.queue.peek()
    }

    // --- Producer ---

    /// Acquire a free slot without waiting.
    pub fn try_push_acquire(&mut self) -> Option<Slot> {
        self.queue.push_acquire(false)
    }

    /// Acquire a free slot, suspending at `at` while the queue is full.
    pub fn push_acquire_async<W, L: Label>(&mut self, cx: &mut TaskCx<'_, W>, at: L) -> Acquire<Slot> {
        if let Some(slot) = self.queue.push_acquire(false) {
            return Acquire::Ready(slot);
        }

        if let Some(task) = self.producer {
            fatal!("another producer already waiting to push (task {})", task.index());
        }

        self.producer = Some(cx.id());
        cx.arm(self.not_full);
        Acquire::Suspended(cx.wait(self.not_full, at))
    }

    /// Finish an acquire that suspended.
    pub fn push_acquire_resumed<W>(&mut self, cx: &mut TaskCx<'_, W>) -> Slot {
        if self.producer != Some(cx.id()) {
            fatal!("task {} resumed a push it was not waiting for", cx.id().index());
        }
        self.producer = None;

        match self.queue.push_acquire(false) {
            Some(slot) => slot,
            None => fatal!("not-full signalled but queue is full"),
        }
    }

    pub fn push_commit_async<W>(&mut self, kernel: &mut Kernel<W>, slot: Slot) {
        self.queue.push_commit(slot);
        kernel.fire(self.not_empty);
    }

    pub fn push_discard_async(&mut self, slot: Slot) {
        self.queue.push_discard(slot);
    }

    // --- Consumer ---

    /// Consume the oldest element without waiting.
    pub fn try_pop_consume(&mut self) -> Option<Consumed> {
        self.queue.pop_consume()
    }

    /// Consume the oldest element, suspending at `at` while the queue is
    /// empty.
    pub fn pop_consume_async<W, L: Label>(&mut self, cx: &mut TaskCx<'_, W>, at: L) -> Acquire<Consumed> {
        if let Some(consumed) = self.queue.pop_consume() {
            return Acquire::Ready(consumed);
        }

        if let Some(task) = self.consumer {
            fatal!("another consumer already waiting to pop (task {})", task.index());
        }

        self.consumer = Some(cx.id());
        cx.arm(self.not_empty);
        Acquire::Suspended(cx.wait(self.not_empty, at))
    }

    pub fn pop_consume_resumed<W>(&mut self, cx: &mut TaskCx<'_, W>) -> Consumed {
        if self.consumer != Some(cx.id()) {
            fatal!("task {} resumed a pop it was not waiting for", cx.id().index());
        }
        self.consumer = None;

        match self.queue.pop_consume() {
            Some(consumed) => consumed,
            None => fatal!("not-empty signalled but queue is empty"),
        }
    }

    pub fn pop_release_async<W>(&mut self, kernel: &mut Kernel<W>, consumed: Consumed) {
        self.queue.pop_release(consumed);
        kernel.fire(self.not_full);
    }
}

impl<T, const N: usize> core::fmt::Debug for AsyncQueue<T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("queue", &self.queue)
            .field("producer", &self.producer)
            .field("consumer", &self.consumer)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
