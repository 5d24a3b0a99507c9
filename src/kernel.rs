//! # Kernel
//!
//! Owns every runtime object (contexts, completion signals, condition
//! groups, timers, interrupt routes) and drives the scheduler passes.
//!
//! There is no global state: the application creates one `Kernel<W>` and
//! hands it, together with its world `W`, to [`Kernel::run`].
//!
//! ## Startup Sequence
//!
//! ```text
//! main()
//!   ├─► Kernel::new()                 ← Empty arenas
//!   ├─► new_signal() / new_group()    ← Allocate primitives
//!   ├─► bind_irq()                    ← Route interrupt mailboxes
//!   ├─► spawn() + start()             ← Arm tasks (×N)
//!   └─► run(world, platform)          ← Scheduler passes (no return)
//!         ├─► drain interrupt mailboxes
//!         ├─► fire expired timers
//!         ├─► resume the tasks ready at pass start
//!         └─► platform.idle() when nothing is ready
//! ```

use core::ops::{Deref, DerefMut};

use heapless::Vec;
use log::trace;

use crate::config::{MAX_GROUPS, MAX_IRQ_ROUTES, MAX_SIGNALS, MAX_TIMERS};
use crate::fatal;
use crate::group::{ConditionGroup, GroupId, WaitMode};
use crate::scheduler::Scheduler;
use crate::signal::{CompletionSignal, SignalId, WaitOutcome};
use crate::sync::{CriticalSection, IrqMailbox};
use crate::task::{ExecutionContext, Label, ResumePoint, Step, TaskFn, TaskId};

/// Time source and idle hook of the board the kernel runs on.
pub trait Platform {
    /// Current time in ticks.
    fn now(&self) -> u64;

    /// Called when a pass found nothing to do. Typically sleeps until the
    /// next interrupt.
    fn idle(&mut self);
}

/// Where the bits drained from an [`IrqMailbox`] are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTarget {
    /// Set the drained bits in a condition group.
    Group(GroupId),
    /// Fire a completion signal if any bit was pending.
    Signal(SignalId),
}

#[derive(Clone, Copy)]
struct IrqRoute {
    mailbox: &'static IrqMailbox,
    target: IrqTarget,
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: u64,
    signal: SignalId,
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct Kernel<W> {
    scheduler: Scheduler<W>,
    signals: Vec<CompletionSignal, MAX_SIGNALS>,
    groups: Vec<ConditionGroup, MAX_GROUPS>,
    timers: Vec<Timer, MAX_TIMERS>,
    irq_routes: Vec<IrqRoute, MAX_IRQ_ROUTES>,
    now: u64,
}

impl<W> Kernel<W> {
    pub const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            signals: Vec::new(),
            groups: Vec::new(),
            timers: Vec::new(),
            irq_routes: Vec::new(),
            now: 0,
        }
    }

    // --- Tasks ---

    /// Allocate an execution context.
    pub fn spawn(&mut self) -> TaskId {
        self.scheduler.spawn()
    }

    /// Arm `task` with `body` and schedule its first run.
    ///
    /// `on_done` fires when the body returns [`Step::DONE`]. Starting a
    /// context that is running or paused is fatal.
    pub fn start(&mut self, task: TaskId, body: TaskFn<W>, arg: usize, on_done: Option<SignalId>) {
        self.scheduler.context_mut(task).arm(body, arg, on_done);
        self.scheduler.schedule(task);
    }

    pub fn context(&self, task: TaskId) -> &ExecutionContext<W> {
        self.scheduler.context(task)
    }

    // --- Completion signals ---

    pub fn new_signal(&mut self) -> SignalId {
        let id = SignalId(self.signals.len() as u8);
        if self.signals.push(CompletionSignal::new()).is_err() {
            fatal!("completion signal arena exhausted ({} signals)", MAX_SIGNALS);
        }
        id
    }

    /// Mark `signal` done and schedule all its waiters in arrival order.
    pub fn fire(&mut self, signal: SignalId) {
        let woken = {
            let _cs = CriticalSection::enter();
            self.signal_mut(signal).fire()
        };
        for task in woken {
            self.scheduler.schedule(task);
        }
    }

    #[inline]
    pub fn is_done(&self, signal: SignalId) -> bool {
        self.signal(signal).is_done()
    }

    /// Reset `signal` to "not done" before reusing it.
    pub fn arm(&mut self, signal: SignalId) {
        self.signal_mut(signal).arm();
    }

    fn signal(&self, signal: SignalId) -> &CompletionSignal {
        match self.signals.get(signal.index()) {
            Some(s) => s,
            None => fatal!("unknown signal handle {}", signal.index()),
        }
    }

    fn signal_mut(&mut self, signal: SignalId) -> &mut CompletionSignal {
        match self.signals.get_mut(signal.index()) {
            Some(s) => s,
            None => fatal!("unknown signal handle {}", signal.index()),
        }
    }

    fn signal_wait(&mut self, signal: SignalId, task: TaskId) {
        let outcome = {
            let _cs = CriticalSection::enter();
            self.signal_mut(signal).wait(task)
        };
        if outcome == WaitOutcome::AlreadyDone {
            self.scheduler.schedule(task);
        }
    }

    // --- Condition groups ---

    pub fn new_group(&mut self) -> GroupId {
        let id = GroupId(self.groups.len() as u8);
        if self.groups.push(ConditionGroup::new()).is_err() {
            fatal!("condition group arena exhausted ({} groups)", MAX_GROUPS);
        }
        id
    }

    pub fn group_set(&mut self, group: GroupId, bits: u32) {
        let woken = {
            let _cs = CriticalSection::enter();
            self.group_mut(group).set(bits)
        };
        if let Some(task) = woken {
            self.scheduler.schedule(task);
        }
    }

    /// Clear `bits`, returning the subset that was actually set.
    pub fn group_clear(&mut self, group: GroupId, bits: u32) -> u32 {
        let (cleared, woken) = {
            let _cs = CriticalSection::enter();
            self.group_mut(group).clear(bits)
        };
        if let Some(task) = woken {
            self.scheduler.schedule(task);
        }
        cleared
    }

    pub fn group_get(&self, group: GroupId, interest: u32) -> u32 {
        self.group(group).get(interest)
    }

    fn group(&self, group: GroupId) -> &ConditionGroup {
        match self.groups.get(group.index()) {
            Some(g) => g,
            None => fatal!("unknown group handle {}", group.index()),
        }
    }

    fn group_mut(&mut self, group: GroupId) -> &mut ConditionGroup {
        match self.groups.get_mut(group.index()) {
            Some(g) => g,
            None => fatal!("unknown group handle {}", group.index()),
        }
    }

    fn group_wait(&mut self, group: GroupId, task: TaskId, interest: u32, mode: WaitMode) {
        let satisfied = {
            let _cs = CriticalSection::enter();
            self.group_mut(group).wait(task, interest, mode)
        };
        if satisfied {
            self.scheduler.schedule(task);
        }
    }

    // --- Interrupts ---

    /// Drain `mailbox` at the start of every pass and deliver its bits to
    /// `target`.
    pub fn bind_irq(&mut self, mailbox: &'static IrqMailbox, target: IrqTarget) {
        if self.irq_routes.push(IrqRoute { mailbox, target }).is_err() {
            fatal!("interrupt route table full ({} routes)", MAX_IRQ_ROUTES);
        }
    }

    fn drain_irqs(&mut self) {
        for i in 0..self.irq_routes.len() {
            let route = self.irq_routes[i];
            let bits = route.mailbox.take();
            if bits == 0 {
                continue;
            }
            match route.target {
                IrqTarget::Group(group) => self.group_set(group, bits),
                IrqTarget::Signal(signal) => self.fire(signal),
            }
        }
    }

    // --- Time ---

    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Advance the kernel clock. Expired timers fire on the next pass.
    pub fn set_time(&mut self, now: u64) {
        self.now = now;
    }

    /// Fire `signal` once `ticks` have elapsed.
    pub fn fire_after(&mut self, signal: SignalId, ticks: u64) {
        let deadline = self.now.saturating_add(ticks);
        self.fire_at(signal, deadline);
    }

    /// Fire `signal` once the clock reaches `deadline`.
    pub fn fire_at(&mut self, signal: SignalId, deadline: u64) {
        if self.timers.push(Timer { deadline, signal }).is_err() {
            fatal!("timer table full ({} timers)", MAX_TIMERS);
        }
    }

    fn expire_timers(&mut self) {
        loop {
            let due = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.deadline <= self.now)
                .min_by_key(|(_, t)| t.deadline)
                .map(|(i, _)| i);

            let Some(index) = due else { break };
            let timer = self.timers.swap_remove(index);
            self.fire(timer.signal);
        }
    }

    // --- Scheduler passes ---

    /// Run one scheduler pass. Returns the number of contexts resumed.
    pub fn run_once(&mut self, world: &mut W) -> usize {
        self.drain_irqs();
        self.expire_timers();

        let batch = self.scheduler.begin_pass();
        for _ in 0..batch {
            let Some(task) = self.scheduler.pop_ready() else {
                break;
            };
            self.resume(world, task);
        }
        batch
    }

    /// Run passes until no context is ready. Returns the number of passes.
    ///
    /// Does not advance time; a task that yields forever keeps this busy.
    pub fn run_until_idle(&mut self, world: &mut W) -> usize {
        let mut passes = 0;
        loop {
            self.run_once(world);
            passes += 1;
            if self.is_idle() {
                return passes;
            }
        }
    }

    /// Drive the system forever.
    pub fn run<P: Platform>(&mut self, world: &mut W, platform: &mut P) -> ! {
        loop {
            self.set_time(platform.now());
            self.run_once(world);
            if self.is_idle() {
                platform.idle();
            }
        }
    }

    /// Nothing is queued to run.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.scheduler.ready_count() == 0
    }

    #[inline]
    pub fn passes(&self) -> u64 {
        self.scheduler.passes()
    }

    fn resume(&mut self, world: &mut W, task: TaskId) {
        let ctx = self.scheduler.context_mut(task);
        let entry = ctx.enter();
        let Some(body) = ctx.body else {
            fatal!("task {} resumed without a body", task.index());
        };
        trace!("resume task {} from {:?}", task.index(), entry);

        let step = body(world, &mut TaskCx { kernel: self, id: task, entry });

        let ctx = self.scheduler.context_mut(task);
        match (step.is_suspended(), ctx.resume_point()) {
            (true, ResumePoint::Paused(_)) => {}
            (false, ResumePoint::Running) => {
                trace!("task {} finished", task.index());
                if let Some(signal) = ctx.finish() {
                    self.fire(signal);
                }
            }
            (true, _) => fatal!("task {} suspended without recording a resume point", task.index()),
            (false, _) => fatal!("task {} returned DONE after suspending", task.index()),
        }
    }
}

impl<W> Default for Kernel<W> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task context
// ---------------------------------------------------------------------------

/// What a task body sees of the kernel while it runs.
///
/// Dereferences to [`Kernel`] for everything that does not suspend (firing
/// signals, setting bits, starting other tasks). The suspension methods
/// record the resume point, register the wait and return the [`Step`] the
/// body must return.
pub struct TaskCx<'k, W> {
    kernel: &'k mut Kernel<W>,
    id: TaskId,
    entry: ResumePoint,
}

impl<'k, W> TaskCx<'k, W> {
    /// Handle of the running context.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The argument passed to `start`.
    #[inline]
    pub fn arg(&self) -> usize {
        self.kernel.scheduler.context(self.id).arg()
    }

    /// `None` on the first run after `start`, otherwise the label the body
    /// last suspended at.
    pub fn resumed_at<L: Label>(&self) -> Option<L> {
        match self.entry {
            ResumePoint::NotStarted => None,
            ResumePoint::Paused(raw) => match L::from_raw(raw) {
                Some(label) => Some(label),
                None => fatal!("task {} resumed at unknown label {}", self.id.index(), raw),
            },
            other => fatal!("task {} entered from {:?}", self.id.index(), other),
        }
    }

    /// Suspend until `signal` fires.
    pub fn wait<L: Label>(&mut self, signal: SignalId, at: L) -> Step {
        self.suspend(at);
        self.kernel.signal_wait(signal, self.id);
        Step::SUSPENDED
    }

    /// Suspend until the predicate `mode` holds for `interest` in `group`.
    pub fn wait_group<L: Label>(&mut self, group: GroupId, interest: u32, mode: WaitMode, at: L) -> Step {
        self.suspend(at);
        self.kernel.group_wait(group, self.id, interest, mode);
        Step::SUSPENDED
    }

    /// Suspend and resume on the next pass.
    pub fn yield_now<L: Label>(&mut self, at: L) -> Step {
        self.suspend(at);
        self.kernel.scheduler.schedule(self.id);
        Step::SUSPENDED
    }

    fn suspend<L: Label>(&mut self, at: L) {
        self.kernel.scheduler.context_mut(self.id).suspend(at.into_raw());
    }
}

impl<'k, W> Deref for TaskCx<'k, W> {
    type Target = Kernel<W>;

    fn deref(&self) -> &Kernel<W> {
        self.kernel
    }
}

impl<'k, W> DerefMut for TaskCx<'k, W> {
    fn deref_mut(&mut self) -> &mut Kernel<W> {
        self.kernel
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
