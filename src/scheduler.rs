//! # Scheduler
//!
//! Context arena and ready queue. The scheduler never runs task bodies
//! itself; [`Kernel::run_once`](crate::kernel::Kernel::run_once) pops the
//! ready queue and resumes each context.
//!
//! ## Scheduling Algorithm
//!
//! A pass resumes exactly the contexts that were ready when the pass began:
//! 1. **Snapshot**: `begin_pass()` records how many contexts are queued
//! 2. **Resume**: that many contexts are popped in FIFO order and resumed
//! 3. **Defer**: anything scheduled while the pass runs (wakeups, yields,
//!    already-fired waits) lands behind the snapshot and runs next pass
//!
//! There are no priorities. Fairness comes from strict FIFO order and from
//! never resuming a context inline from inside another one.

use heapless::{Deque, Vec};

use crate::config::MAX_TASKS;
use crate::fatal;
use crate::task::{ExecutionContext, TaskId};

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Holds every execution context and the queue of contexts due to run.
///
/// ## Design Notes
///
/// - Contexts are stored inline in a fixed-capacity arena (no heap)
/// - A context is addressed by its [`TaskId`] for its whole lifetime
/// - A context is on the ready queue at most once: it either waits on one
///   primitive or sits in the queue, never both
pub struct Scheduler<W> {
    contexts: Vec<ExecutionContext<W>, MAX_TASKS>,
    ready: Deque<TaskId, MAX_TASKS>,
    passes: u64,
}

impl<W> Scheduler<W> {
    pub const fn new() -> Self {
        Self {
            contexts: Vec::new(),
            ready: Deque::new(),
            passes: 0,
        }
    }

    /// Allocate a fresh, not-started context.
    pub fn spawn(&mut self) -> TaskId {
        let id = TaskId(self.contexts.len() as u8);
        if self.contexts.push(ExecutionContext::new()).is_err() {
            fatal!("execution context arena exhausted ({} contexts)", MAX_TASKS);
        }
        id
    }

    pub fn context(&self, task: TaskId) -> &ExecutionContext<W> {
        match self.contexts.get(task.index()) {
            Some(ctx) => ctx,
            None => fatal!("unknown task handle {}", task.index()),
        }
    }

    pub fn context_mut(&mut self, task: TaskId) -> &mut ExecutionContext<W> {
        match self.contexts.get_mut(task.index()) {
            Some(ctx) => ctx,
            None => fatal!("unknown task handle {}", task.index()),
        }
    }

    /// Queue `task` to be resumed on a later pass.
    pub fn schedule(&mut self, task: TaskId) {
        if self.ready.push_back(task).is_err() {
            fatal!("ready queue overflow scheduling task {}", task.index());
        }
    }

    /// Start a pass, returning how many contexts it will resume.
    pub fn begin_pass(&mut self) -> usize {
        self.passes = self.passes.wrapping_add(1);
        self.ready.len()
    }

    pub fn pop_ready(&mut self) -> Option<TaskId> {
        self.ready.pop_front()
    }

    #[inline]
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Number of allocated contexts.
    #[inline]
    pub fn task_count(&self) -> usize {
        self.contexts.len()
    }

    #[inline]
    pub fn passes(&self) -> u64 {
        self.passes
    }
}

impl<W> Default for Scheduler<W> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
