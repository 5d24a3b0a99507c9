//! # corolink: cooperative tasks and a flow-controlled packet link
//!
//! A `no_std` runtime for microcontrollers built from stackless
//! cooperative tasks, plus the pieces needed to move packets over a
//! full-duplex SPI-style bus.
//!
//! ## Overview
//!
//! Tasks are plain functions that run until they must wait, record where to
//! continue, and return. Nothing is preempted and no task owns a stack, so
//! every piece of state that crosses a suspension point lives in the
//! application's *world* type `W`, which the kernel lends to each task body
//! on resume.
//!
//! - **Completion signals** wake every waiter in arrival order when fired
//! - **Condition groups** hold 32 bits and wake one waiter when its ANY/ALL
//!   predicate becomes true
//! - **Queues** hand out slot tokens so producers fill and consumers read
//!   elements in place, without copies
//! - **The link** exchanges one packet in each direction per transfer round,
//!   gated by ready-to-send lines on both sides
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              Application world + task bodies            │
//! ├───────────────────────────┬────────────────────────────┤
//! │  Router (router.rs)       │  AsyncQueue                │
//! │  ─ dispatch by function   │  (queue_async.rs)          │
//! │  ─ serialized sends       │  ─ suspend on full / empty │
//! ├───────────────────────────┤                            │
//! │  Link (link.rs)           │  Queue (queue.rs)          │
//! │  ─ header/head/tail phases│  ─ acquire/commit          │
//! │  ─ LinkBus trait          │  ─ consume/release         │
//! ├───────────────────────────┴────────────────────────────┤
//! │                 Kernel (kernel.rs)                      │
//! │   start() · fire() · group_set() · fire_after() · run() │
//! ├──────────────┬─────────────────┬───────────────────────┤
//! │  Scheduler   │  Signals        │  Sync                 │
//! │  scheduler.rs│  signal.rs      │  sync.rs              │
//! │  task.rs     │  group.rs       │  ─ CriticalSection    │
//! │              │                 │  ─ IrqMailbox         │
//! ├──────────────┴─────────────────┴───────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)                │
//! │        SysTick · WFI idle · ITM logger                  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Writing a task
//!
//! ```ignore
//! resume_points! {
//!     enum Wake { Woken }
//! }
//!
//! fn waiter(w: &mut World, cx: &mut TaskCx<'_, World>) -> Step {
//!     match cx.resumed_at::<Wake>() {
//!         None => cx.wait(w.ready, Wake::Woken),
//!         Some(Wake::Woken) => {
//!             w.count += 1;
//!             Step::DONE
//!         }
//!     }
//! }
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: every arena is a fixed-capacity `heapless` collection
//! - **Handles, not pointers**: tasks, signals and groups are addressed by
//!   `TaskId`, `SignalId` and `GroupId`
//! - **Interrupts never touch kernel objects**: handlers raise bits in an
//!   `IrqMailbox` that the kernel drains at the start of each pass
//! - **Critical sections**: the `critical-section` crate, held only around
//!   check-and-enqueue and mailbox draining

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod sync;
pub mod task;
pub mod signal;
pub mod group;
pub mod scheduler;
pub mod kernel;
pub mod queue;
pub mod queue_async;
pub mod link;
pub mod router;
pub mod arch;

#[doc(hidden)]
pub use log as __log;
