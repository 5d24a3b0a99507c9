//! # Completion Signal
//!
//! A one-shot "done" flag plus the FIFO list of contexts waiting for it.
//! Every suspension in the kernel goes through one of these.
//!
//! The waiter list is owned by the signal as a fixed-capacity deque of
//! [`TaskId`] handles; nothing reaches into caller memory. A signal is
//! single-use: once fired it stays done until it is re-armed.
//!
//! Scheduling of woken tasks is the kernel's job; this module only decides
//! *who* must be woken. See [`Kernel::fire`](crate::kernel::Kernel::fire)
//! and [`TaskCx::wait`](crate::kernel::TaskCx::wait).

use heapless::Deque;

use crate::config::MAX_WAITERS;
use crate::fatal;
use crate::task::TaskId;

/// Handle of a completion signal in the kernel's signal arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(pub(crate) u8);

impl SignalId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Outcome of registering a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The signal has not fired; the waiter stays queued until it does.
    Queued,
    /// The signal had already fired; the caller must schedule the waiter for
    /// the next pass instead of resuming it inline.
    AlreadyDone,
}

pub struct CompletionSignal {
    done: bool,
    waiters: Deque<TaskId, MAX_WAITERS>,
}

impl CompletionSignal {
    pub const fn new() -> Self {
        Self {
            done: false,
            waiters: Deque::new(),
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of queued waiters.
    #[inline]
    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Reset to "not done" for a fresh use.
    ///
    /// Re-arming while contexts are still queued would lose their wakeups.
    pub fn arm(&mut self) {
        if !self.waiters.is_empty() {
            fatal!("signal re-armed with {} waiter(s) still queued", self.waiters.len());
        }
        self.done = false;
    }

    /// Append `task` to the waiter list.
    ///
    /// If the signal already fired the list is emptied again and the caller
    /// is told to schedule `task` itself.
    pub fn wait(&mut self, task: TaskId) -> WaitOutcome {
        if self.waiters.push_back(task).is_err() {
            fatal!("too many waiters on one signal (capacity {})", MAX_WAITERS);
        }

        if self.done {
            self.waiters.clear();
            WaitOutcome::AlreadyDone
        } else {
            WaitOutcome::Queued
        }
    }

    /// Mark done and hand back every queued waiter, in arrival order.
    pub fn fire(&mut self) -> Deque<TaskId, MAX_WAITERS> {
        self.done = true;
        core::mem::take(&mut self.waiters)
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("done", &self.done)
            .field("waiting", &self.waiters.len())
            .finish()
    }
}
