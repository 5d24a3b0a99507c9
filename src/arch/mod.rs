//! # Architecture Abstraction Layer
//!
//! Everything above this module is portable and runs on the host for unit
//! tests. Target code supplies a [`Platform`](crate::kernel::Platform) (time
//! base and idle), interrupt handlers that raise
//! [`IrqMailbox`](crate::sync::IrqMailbox) bits, and a logger.
//!
//! Currently implements the Cortex-M4 port; extensible to other
//! architectures by adding sibling modules.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
