//! # Synchronization Primitives
//!
//! Interrupt-safe building blocks shared by the kernel and interrupt handlers.
//!
//! The only locking discipline in the system is: disable interrupts, mutate,
//! re-enable. [`CriticalSection`] wraps that as a scoped guard, and
//! [`IrqMailbox`] is the one object an interrupt handler is allowed to touch.
//! It records pending bits that the kernel drains at the start of every pass.

use core::cell::Cell;

use critical_section::{Mutex, RestoreState};

/// Scoped interrupt-disable guard.
///
/// Interrupts are disabled when the guard is created and restored when it is
/// dropped. Never hold one across a suspension point.
#[must_use = "the critical section ends as soon as the guard is dropped"]
pub struct CriticalSection {
    restore: RestoreState,
}

impl CriticalSection {
    /// Disable interrupts until the returned guard is dropped.
    #[inline]
    pub fn enter() -> Self {
        // SAFETY: paired with the `release` in `Drop`, on the same thread.
        let restore = unsafe { critical_section::acquire() };
        Self { restore }
    }
}

impl Drop for CriticalSection {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `restore` came from the matching `acquire` in `enter`.
        unsafe { critical_section::release(self.restore) }
    }
}

/// Execute a closure within a critical section (interrupts disabled).
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// Pending-bit cell raised from interrupt context.
///
/// Declare one as a `static` per interrupt source, raise bits from the
/// handler, and bind it to a condition group or completion signal with
/// [`Kernel::bind_irq`](crate::kernel::Kernel::bind_irq).
///
/// ```ignore
/// static PEER_READY_IRQ: IrqMailbox = IrqMailbox::new();
///
/// #[interrupt]
/// fn EXTI0() {
///     PEER_READY_IRQ.raise(LinkEvents::PEER_READY.bits());
/// }
/// ```
pub struct IrqMailbox {
    bits: Mutex<Cell<u32>>,
}

impl IrqMailbox {
    pub const fn new() -> Self {
        Self {
            bits: Mutex::new(Cell::new(0)),
        }
    }

    /// Record `bits` as pending. Safe to call from any interrupt priority.
    pub fn raise(&self, bits: u32) {
        critical_section(|cs| {
            let cell = self.bits.borrow(cs);
            cell.set(cell.get() | bits);
        });
    }

    /// Take and clear all pending bits.
    pub fn take(&self) -> u32 {
        critical_section(|cs| self.bits.borrow(cs).replace(0))
    }

    /// Pending bits, without clearing them.
    pub fn pending(&self) -> u32 {
        critical_section(|cs| self.bits.borrow(cs).get())
    }
}

impl Default for IrqMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for IrqMailbox {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqMailbox")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_accumulates_and_drains() {
        let mailbox = IrqMailbox::new();
        mailbox.raise(0b001);
        mailbox.raise(0b100);
        assert_eq!(mailbox.pending(), 0b101);
        assert_eq!(mailbox.take(), 0b101);
        assert_eq!(mailbox.take(), 0);
    }

    #[test]
    fn test_guard_nests_with_closure_form() {
        let mailbox = IrqMailbox::new();
        {
            let _cs = CriticalSection::enter();
            mailbox.raise(1);
        }
        assert_eq!(mailbox.take(), 1);
    }
}
