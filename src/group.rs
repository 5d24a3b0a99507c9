//! # Condition Group
//!
//! A 32-bit mask of independently settable conditions with at most one
//! outstanding waiter, woken when `ANY` or `ALL` of its interest bits hold.
//!
//! Exactly one pending waiter is supported. Several logical waiters on the
//! same conditions must be composed by an arbiter task that owns the wait.

use crate::fatal;
use crate::task::TaskId;

/// Handle of a condition group in the kernel's group arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) u8);

impl GroupId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which predicate a wait is satisfied by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// At least one interest bit is set.
    Any,
    /// Every interest bit is set.
    All,
}

impl WaitMode {
    #[inline]
    pub fn holds(self, mask: u32, interest: u32) -> bool {
        match self {
            WaitMode::Any => mask & interest != 0,
            WaitMode::All => mask & interest == interest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupWaiter {
    task: TaskId,
    interest: u32,
    mode: WaitMode,
}

#[derive(Debug, Default)]
pub struct ConditionGroup {
    mask: u32,
    waiter: Option<GroupWaiter>,
}

impl ConditionGroup {
    pub const fn new() -> Self {
        Self {
            mask: 0,
            waiter: None,
        }
    }

    /// The currently-set subset of `interest`. No side effects.
    #[inline]
    pub fn get(&self, interest: u32) -> u32 {
        self.mask & interest
    }

    #[inline]
    pub fn test(&self, interest: u32, mode: WaitMode) -> bool {
        mode.holds(self.mask, interest)
    }

    #[inline]
    pub fn has_waiter(&self) -> bool {
        self.waiter.is_some()
    }

    /// Set `bits`, returning the waiter to wake if its predicate now holds.
    pub fn set(&mut self, bits: u32) -> Option<TaskId> {
        self.mask |= bits;
        self.update()
    }

    /// Clear `bits`. Returns the subset that was actually set, plus the
    /// waiter to wake if its predicate holds after the update.
    pub fn clear(&mut self, bits: u32) -> (u32, Option<TaskId>) {
        let cleared = self.mask & bits;
        self.mask &= !cleared;
        (cleared, self.update())
    }

    /// Register `task` as the single pending waiter.
    ///
    /// Returns `true` when the predicate already holds; the registration is
    /// then dropped again and the caller must schedule `task` itself.
    pub fn wait(&mut self, task: TaskId, interest: u32, mode: WaitMode) -> bool {
        if let Some(waiter) = self.waiter {
            fatal!(
                "second concurrent wait on a condition group (task {} already waiting on {:#x})",
                waiter.task.index(),
                waiter.interest
            );
        }

        if self.test(interest, mode) {
            return true;
        }

        self.waiter = Some(GroupWaiter { task, interest, mode });
        false
    }

    fn update(&mut self) -> Option<TaskId> {
        let waiter = self.waiter?;
        if self.test(waiter.interest, waiter.mode) {
            self.waiter = None;
            Some(waiter.task)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: u32 = 1 << 0;
    const B: u32 = 1 << 1;
    const C: u32 = 1 << 2;

    #[test]
    fn test_any_wakes_on_first_bit() {
        let mut group = ConditionGroup::new();
        assert!(!group.wait(TaskId(1), A | B, WaitMode::Any));
        assert_eq!(group.set(C), None);
        assert_eq!(group.set(B), Some(TaskId(1)));
        assert!(!group.has_waiter());
        assert_eq!(group.get(A | B), B);
    }

    #[test]
    fn test_all_wakes_only_when_complete() {
        let mut group = ConditionGroup::new();
        assert!(!group.wait(TaskId(4), A | B, WaitMode::All));
        assert_eq!(group.set(B), None);
        assert_eq!(group.set(A), Some(TaskId(4)));

        // Woken exactly once
        assert_eq!(group.set(A | B), None);
    }

    #[test]
    fn test_wait_already_satisfied() {
        let mut group = ConditionGroup::new();
        group.set(A | C);
        assert!(group.wait(TaskId(0), C, WaitMode::All));
        assert!(!group.has_waiter());
    }

    #[test]
    fn test_clear_reports_cleared_subset() {
        let mut group = ConditionGroup::new();
        group.set(A | B);
        assert_eq!(group.clear(B | C), (B, None));
        assert_eq!(group.get(A | B | C), A);
    }

    #[test]
    fn test_clear_keeps_unsatisfied_waiter() {
        let mut group = ConditionGroup::new();
        assert!(!group.wait(TaskId(2), A, WaitMode::Any));
        assert_eq!(group.clear(A), (0, None));
        assert!(group.has_waiter());
    }

    #[test]
    #[should_panic(expected = "second concurrent wait on a condition group")]
    fn test_second_waiter_is_fatal() {
        let mut group = ConditionGroup::new();
        assert!(!group.wait(TaskId(0), A, WaitMode::Any));
        group.wait(TaskId(1), B, WaitMode::Any);
    }
}
