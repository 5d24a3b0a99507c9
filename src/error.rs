//! # Error Handling
//!
//! Two classes of failure, handled in opposite ways:
//!
//! - **Usage violations** (broken internal contracts: starting a running
//!   task, out-of-order queue commits, a second waiter where only one is
//!   allowed, oversized send requests) are unrecoverable. [`fatal!`] logs the
//!   diagnostic and panics; on the target `panic-halt` stops the core.
//! - **Wire-level corruption** is tolerated. It surfaces as a [`LinkError`],
//!   is logged and counted, and the affected packet is dropped.

use thiserror::Error;

/// Report a usage violation and halt.
///
/// ```ignore
/// fatal!("attempt to commit element out-of-order (slot {})", index);
/// ```
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {{
        $crate::__log::error!($($arg)+);
        ::core::panic!($($arg)+)
    }};
}

/// Transient failures caused by what arrived on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The peer announced more payload than a packet can carry.
    #[error("declared payload of {declared} bytes exceeds the {max} byte MTU")]
    Oversized { declared: u16, max: usize },

    /// The routing header carries a protocol version this node does not speak.
    #[error("unsupported protocol version {found}, expected {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },

    /// No handler is registered for the packet's function.
    #[error("no handler registered for function {function:#04x}")]
    Unrouted { function: u8 },
}
