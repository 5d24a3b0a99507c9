//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor: the
//! SysTick time base, the idle hook and an ITM logger.
//!
//! Tasks are stackless, so there is no context switch here. All tasks run
//! on the main stack from [`Kernel::run`](crate::kernel::Kernel::run);
//! interrupt handlers only count ticks or raise mailbox bits.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: lowest priority, it never delays a peripheral interrupt

use core::cell::{Cell, RefCell};

use cortex_m::iprintln;
use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{ITM, SCB, SYST};
use critical_section::Mutex;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Platform;

// ---------------------------------------------------------------------------
// SysTick time base
// ---------------------------------------------------------------------------

/// Ticks since `configure_systick`. 64 bits never wrap in practice; no
/// 64-bit atomics on this core, hence the critical section.
static TICKS: Mutex<Cell<u64>> = Mutex::new(Cell::new(0));

/// Configure the SysTick timer for the kernel tick.
///
/// Sets up SysTick to fire at `TICK_HZ` frequency using the processor
/// clock, at the lowest exception priority.
pub fn configure_systick(syst: &mut SYST, scb: &mut SCB) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);

    // SAFETY: no priority-based critical sections depend on SysTick
    unsafe {
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }

    syst.enable_counter();
    syst.enable_interrupt();
}

/// Current tick count.
pub fn ticks() -> u64 {
    critical_section::with(|cs| TICKS.borrow(cs).get())
}

/// SysTick exception handler. Only advances the tick counter; timers are
/// expired by the kernel at the start of its next pass.
#[no_mangle]
pub extern "C" fn SysTick() {
    critical_section::with(|cs| {
        let ticks = TICKS.borrow(cs);
        ticks.set(ticks.get().wrapping_add(1));
    });
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// The kernel's view of a Cortex-M4 core.
#[derive(Debug, Default)]
pub struct CortexM4;

impl Platform for CortexM4 {
    fn now(&self) -> u64 {
        ticks()
    }

    /// Sleep until the next interrupt. SysTick bounds the sleep to one tick,
    /// so a mailbox raised just before WFI is picked up on the next tick.
    fn idle(&mut self) {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// ITM logger
// ---------------------------------------------------------------------------

/// `log` backend writing one line per record to ITM stimulus port 0.
pub struct ItmLogger {
    itm: Mutex<RefCell<Option<ITM>>>,
}

impl ItmLogger {
    pub const fn new() -> Self {
        Self {
            itm: Mutex::new(RefCell::new(None)),
        }
    }
}

impl Default for ItmLogger {
    fn default() -> Self {
        Self::new()
    }
}

static LOGGER: ItmLogger = ItmLogger::new();

/// Install the ITM logger at `level`.
pub fn init_logger(itm: ITM, level: LevelFilter) -> Result<(), SetLoggerError> {
    critical_section::with(|cs| LOGGER.itm.borrow_ref_mut(cs).replace(itm));
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

impl Log for ItmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        critical_section::with(|cs| {
            if let Some(itm) = self.itm.borrow_ref_mut(cs).as_mut() {
                iprintln!(
                    &mut itm.stim[0],
                    "[{}] {}: {}",
                    record.level(),
                    record.target(),
                    record.args()
                );
            }
        });
    }

    fn flush(&self) {}
}
