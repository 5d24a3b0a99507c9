//! # Corolink Configuration
//!
//! Compile-time constants sizing every kernel object and the link protocol.
//! All limits are fixed at compile time. There is no dynamic allocation.

/// Maximum number of execution contexts. Bounds the context arena and the
/// ready queue (a context is queued at most once at any time).
pub const MAX_TASKS: usize = 16;

/// Number of completion signals the kernel can hand out.
pub const MAX_SIGNALS: usize = 32;

/// Number of condition groups the kernel can hand out.
pub const MAX_GROUPS: usize = 4;

/// Capacity of a single completion signal's waiter list.
pub const MAX_WAITERS: usize = MAX_TASKS;

/// Number of one-shot timers that may be armed at once.
pub const MAX_TIMERS: usize = 8;

/// Number of interrupt mailboxes the kernel drains on every pass.
pub const MAX_IRQ_ROUTES: usize = 4;

/// SysTick frequency in Hz. One timer tick per SysTick interrupt.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (STM32F405 running from the 168 MHz PLL).
pub const SYSTEM_CLOCK_HZ: u32 = 168_000_000;

/// Maximum total size of a link packet (header + payload). Bounded by the
/// peer's largest DMA transfer and shared by both ends of the link.
pub const LINK_MAX_PACKET_LENGTH: usize = 4092;

/// Minimum transfer unit of the link bus. Every transfer length, payload
/// part length and buffer address must be a multiple of this.
pub const LINK_TRANSFER_GRANULARITY: usize = 4;

/// Size of the on-wire link header (`u16` length + 2-byte routing header).
pub const LINK_HEADER_LENGTH: usize = 4;

/// Maximum payload of a single link packet.
pub const LINK_MTU: usize = LINK_MAX_PACKET_LENGTH - LINK_HEADER_LENGTH;

/// Routing header version understood by this node.
pub const PROTOCOL_VERSION: u8 = 0;

/// Number of sends the router can hold queued at the same time.
pub const ROUTER_SEND_SLOTS: usize = 4;

const _: () = assert!(LINK_MAX_PACKET_LENGTH % LINK_TRANSFER_GRANULARITY == 0);
const _: () = assert!(LINK_MTU % LINK_TRANSFER_GRANULARITY == 0);
const _: () = assert!(LINK_HEADER_LENGTH % LINK_TRANSFER_GRANULARITY == 0);
