//! # Execution Context
//!
//! Defines the stackless task model. Every logical task shares the one
//! physical call stack: a task body is an ordinary function that runs from
//! its recorded resume point up to the next suspension point and then
//! returns to the kernel.
//!
//! ## Resume points
//!
//! ```text
//!               start()                 resume
//!   ┌────────────┐     ┌─────────┐  ◄────────────  ┌────────────┐
//!   │ NotStarted │ ──► │ Running │                 │ Paused(L)  │
//!   └────────────┘     └─────────┘  ────────────►  └────────────┘
//!         ▲                 │          wait/yield
//!         │ start()         │ Step::DONE
//!         │            ┌──────────┐
//!         └─────────── │ Finished │
//!                      └──────────┘
//! ```
//!
//! Anything a task needs across a suspension point lives in the application
//! world `W` (or the context argument), never in locals of the body.

use crate::fatal;
use crate::kernel::TaskCx;
use crate::signal::SignalId;

/// Handle of an execution context in the kernel's context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    /// Index of the context in the arena.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Where a context will continue the next time it is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Armed (or never used); the next resume enters the body from the top.
    NotStarted,
    /// The body is executing right now.
    Running,
    /// The body fell off its end or returned [`Step::DONE`].
    Finished,
    /// Suspended at the given label.
    Paused(u16),
}

/// A task body: runs one slice of the task and reports how it stopped.
pub type TaskFn<W> = fn(&mut W, &mut TaskCx<'_, W>) -> Step;

/// How a task body gave control back to the kernel.
///
/// A suspended step can only be produced by the suspension methods of
/// [`TaskCx`], which also record the resume point and register the wait.
#[must_use = "return the step from the task body"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step(pub(crate) StepKind);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepKind {
    Suspended,
    Done,
}

impl Step {
    /// Terminal step: the context becomes `Finished` and its completion
    /// signal, if any, fires.
    pub const DONE: Step = Step(StepKind::Done);

    pub(crate) const SUSPENDED: Step = Step(StepKind::Suspended);

    /// Whether the task stopped at a suspension point.
    pub fn is_suspended(self) -> bool {
        self.0 == StepKind::Suspended
    }
}

/// A typed resume point. Declare implementations with [`resume_points!`].
///
/// [`resume_points!`]: crate::resume_points
pub trait Label: Copy {
    fn into_raw(self) -> u16;
    fn from_raw(raw: u16) -> Option<Self>;
}

/// Declare the suspension points of a task body as an enum.
///
/// ```ignore
/// resume_points! {
///     enum Producer { Acquired, Paced }
/// }
///
/// fn producer(world: &mut World, cx: &mut TaskCx<'_, World>) -> Step {
///     match cx.resumed_at::<Producer>() {
///         None => cx.wait(world.tick, Producer::Paced),
///         Some(Producer::Paced) => { /* ... */ Step::DONE }
///         Some(Producer::Acquired) => { /* ... */ Step::DONE }
///     }
/// }
/// ```
#[macro_export]
macro_rules! resume_points {
    ($(#[$meta:meta])* $vis:vis enum $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        $vis enum $name {
            $($variant),+
        }

        impl $crate::task::Label for $name {
            #[inline]
            fn into_raw(self) -> u16 {
                self as u16
            }

            fn from_raw(raw: u16) -> ::core::option::Option<Self> {
                $(
                    if raw == $name::$variant as u16 {
                        return ::core::option::Option::Some($name::$variant);
                    }
                )+
                ::core::option::Option::None
            }
        }
    };
}

/// One logical task instance.
///
/// Owned by the kernel's arena and referenced by [`TaskId`]; the kernel never
/// copies or frees it. While paused on a completion signal the context is
/// referenced from that signal's waiter list by handle.
pub struct ExecutionContext<W> {
    /// Task body, set by `start`.
    pub(crate) body: Option<TaskFn<W>>,

    /// Opaque argument handed to the body on every resume.
    pub(crate) arg: usize,

    /// Where the body continues next.
    pub(crate) resume: ResumePoint,

    /// Fired when the body finishes.
    pub(crate) on_done: Option<SignalId>,

    /// Number of times the body has been entered. Diagnostics only.
    pub(crate) resumes: u32,
}

impl<W> ExecutionContext<W> {
    pub const fn new() -> Self {
        Self {
            body: None,
            arg: 0,
            resume: ResumePoint::NotStarted,
            on_done: None,
            resumes: 0,
        }
    }

    /// Arm the context for a fresh run of `body`.
    ///
    /// Only legal from `Finished` or a `NotStarted` context that was never
    /// armed. An armed context already sits on the ready queue.
    pub(crate) fn arm(&mut self, body: TaskFn<W>, arg: usize, on_done: Option<SignalId>) {
        if self.is_live() || self.resume == ResumePoint::Running {
            fatal!("task started while already running ({:?})", self.resume);
        }

        self.body = Some(body);
        self.arg = arg;
        self.resume = ResumePoint::NotStarted;
        self.on_done = on_done;
        self.resumes = 0;
    }

    /// Transition into `Running`, returning the point the body resumes from.
    pub(crate) fn enter(&mut self) -> ResumePoint {
        let from = self.resume;
        match from {
            ResumePoint::NotStarted | ResumePoint::Paused(_) => {}
            ResumePoint::Running => fatal!("task resumed without being properly suspended first"),
            ResumePoint::Finished => fatal!("task resumed after having concluded"),
        }
        self.resume = ResumePoint::Running;
        self.resumes = self.resumes.wrapping_add(1);
        from
    }

    /// Record a suspension at `label`.
    pub(crate) fn suspend(&mut self, label: u16) {
        if self.resume != ResumePoint::Running {
            fatal!("suspension recorded for a task that is not running ({:?})", self.resume);
        }
        self.resume = ResumePoint::Paused(label);
    }

    /// Record termination, returning the completion signal to fire.
    pub(crate) fn finish(&mut self) -> Option<SignalId> {
        self.resume = ResumePoint::Finished;
        self.on_done
    }

    #[inline]
    pub fn resume_point(&self) -> ResumePoint {
        self.resume
    }

    #[inline]
    pub fn arg(&self) -> usize {
        self.arg
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.resume == ResumePoint::Finished
    }

    /// Resumable by the kernel: started or paused.
    #[inline]
    pub fn is_live(&self) -> bool {
        matches!(self.resume, ResumePoint::Paused(_)) || (self.resume == ResumePoint::NotStarted && self.body.is_some())
    }

    #[inline]
    pub fn resumes(&self) -> u32 {
        self.resumes
    }
}

impl<W> Default for ExecutionContext<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> core::fmt::Debug for ExecutionContext<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("arg", &self.arg)
            .field("resume", &self.resume)
            .field("on_done", &self.on_done)
            .field("resumes", &self.resumes)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct World;

    fn body(_: &mut World, _: &mut TaskCx<'_, World>) -> Step {
        Step::DONE
    }

    resume_points! {
        enum Points { First, Second, Third }
    }

    #[test]
    fn test_context_lifecycle() {
        let mut ctx = ExecutionContext::<World>::new();
        assert_eq!(ctx.resume_point(), ResumePoint::NotStarted);
        assert!(!ctx.is_live());

        ctx.arm(body, 42, None);
        assert!(ctx.is_live());
        assert_eq!(ctx.arg(), 42);

        assert_eq!(ctx.enter(), ResumePoint::NotStarted);
        assert_eq!(ctx.resume_point(), ResumePoint::Running);

        ctx.suspend(3);
        assert_eq!(ctx.resume_point(), ResumePoint::Paused(3));
        assert_eq!(ctx.enter(), ResumePoint::Paused(3));

        assert_eq!(ctx.finish(), None);
        assert!(ctx.is_finished());
        assert_eq!(ctx.resumes(), 2);

        // A finished context may be started again
        ctx.arm(body, 7, None);
        assert_eq!(ctx.resume_point(), ResumePoint::NotStarted);
    }

    #[test]
    #[should_panic(expected = "task started while already running")]
    fn test_restart_while_paused_is_fatal() {
        let mut ctx = ExecutionContext::<World>::new();
        ctx.arm(body, 0, None);
        ctx.enter();
        ctx.suspend(1);
        ctx.arm(body, 0, None);
    }

    #[test]
    #[should_panic(expected = "task started while already running (NotStarted)")]
    fn test_rearm_before_first_run_is_fatal() {
        let mut ctx = ExecutionContext::<World>::new();
        ctx.arm(body, 0, None);
        ctx.arm(body, 1, None);
    }

    #[test]
    #[should_panic(expected = "task resumed after having concluded")]
    fn test_resume_finished_is_fatal() {
        let mut ctx = ExecutionContext::<World>::new();
        ctx.arm(body, 0, None);
        ctx.enter();
        ctx.finish();
        ctx.enter();
    }

    #[test]
    #[should_panic(expected = "task resumed without being properly suspended first")]
    fn test_resume_running_is_fatal() {
        let mut ctx = ExecutionContext::<World>::new();
        ctx.arm(body, 0, None);
        ctx.enter();
        ctx.enter();
    }

    #[test]
    fn test_label_round_trip() {
        assert_eq!(Points::from_raw(Points::Second.into_raw()), Some(Points::Second));
        assert_eq!(Points::from_raw(Points::Third.into_raw()), Some(Points::Third));
        assert_eq!(Points::from_raw(99), None);
        assert_eq!(Points::First.into_raw(), 0);
    }
}
