//! # corolink Example Firmware
//!
//! A camera-style pipeline on stackless tasks:
//!
//! | Task | Role |
//! |------|------|
//! | `producer` | Captures a frame descriptor every `FRAME_PERIOD_TICKS`, blocking while the queue is full |
//! | `consumer` | Takes frames in order, joins a `checksum` child per frame, then releases the slot |
//! | `checksum` | Child task started once per frame; the consumer waits on its completion |
//!
//! ## Expected Output (ITM port 0)
//!
//! ```text
//! [INFO] corolink: frame 0 captured at tick 50, checksum 0x...
//! [INFO] corolink: frame 1 captured at tick 100, checksum 0x...
//! ```
//!
//! Producer and consumer only ever meet through the queue's two signals, so
//! slowing either one down just shifts where the other one waits.

#![no_std]
#![no_main]

use cortex_m_rt::entry;
use log::{info, LevelFilter};
use panic_halt as _;

use corolink::arch::cortex_m4::{self, CortexM4};
use corolink::fatal;
use corolink::kernel::{Kernel, TaskCx};
use corolink::queue::Consumed;
use corolink::queue_async::{Acquire, AsyncQueue};
use corolink::resume_points;
use corolink::signal::SignalId;
use corolink::task::{Step, TaskId};

/// Ticks between two captures.
const FRAME_PERIOD_TICKS: u64 = 50;

/// Frames in flight between producer and consumer.
const QUEUE_DEPTH: usize = 4;

#[derive(Debug, Default, Clone, Copy)]
struct Frame {
    seq: u32,
    captured_at: u64,
}

struct World {
    frames: AsyncQueue<Frame, QUEUE_DEPTH>,
    next_seq: u32,

    /// Paces the producer.
    shutter: SignalId,

    /// Frame held by the consumer while its checksum runs.
    in_hand: Option<Consumed>,
    checker: TaskId,
    checked: SignalId,
    checksum: u32,
}

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

resume_points! {
    enum Produce { Shutter, Space }
}

fn producer(w: &mut World, cx: &mut TaskCx<'_, World>) -> Step {
    let slot = match cx.resumed_at::<Produce>() {
        None => return wait_for_shutter(w, cx),
        Some(Produce::Shutter) => match w.frames.push_acquire_async(cx, Produce::Space) {
            Acquire::Ready(slot) => slot,
            Acquire::Suspended(step) => return step,
        },
        Some(Produce::Space) => w.frames.push_acquire_resumed(cx),
    };

    *w.frames.slot_mut(&slot) = Frame {
        seq: w.next_seq,
        captured_at: cx.now(),
    };
    w.next_seq = w.next_seq.wrapping_add(1);
    w.frames.push_commit_async(cx, slot);

    wait_for_shutter(w, cx)
}

fn wait_for_shutter(w: &mut World, cx: &mut TaskCx<'_, World>) -> Step {
    cx.arm(w.shutter);
    cx.fire_after(w.shutter, FRAME_PERIOD_TICKS);
    cx.wait(w.shutter, Produce::Shutter)
}

resume_points! {
    enum Consume { Ready, Checked }
}

fn consumer(w: &mut World, cx: &mut TaskCx<'_, World>) -> Step {
    let mut resumed = cx.resumed_at::<Consume>();

    loop {
        let consumed = match resumed.take() {
            None => match w.frames.pop_consume_async(cx, Consume::Ready) {
                Acquire::Ready(consumed) => consumed,
                Acquire::Suspended(step) => return step,
            },
            Some(Consume::Ready) => w.frames.pop_consume_resumed(cx),
            Some(Consume::Checked) => {
                let Some(consumed) = w.in_hand.take() else {
                    fatal!("checksum finished with no frame in hand");
                };
                let frame = w.frames.get(&consumed);
                info!(
                    "frame {} captured at tick {}, checksum {:#010x}",
                    frame.seq, frame.captured_at, w.checksum
                );
                w.frames.pop_release_async(cx, consumed);
                continue;
            }
        };

        // Join a child per frame
        w.in_hand = Some(consumed);
        cx.arm(w.checked);
        cx.start(w.checker, checksum, 0, Some(w.checked));
        return cx.wait(w.checked, Consume::Checked);
    }
}

fn checksum(w: &mut World, _cx: &mut TaskCx<'_, World>) -> Step {
    if let Some(consumed) = w.in_hand.as_ref() {
        let frame = w.frames.get(consumed);
        w.checksum = frame.seq.wrapping_mul(0x9e37_79b9) ^ (frame.captured_at as u32);
    }
    Step::DONE
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Firmware entry point. Sets up the time base and logging, starts the
/// pipeline and hands the core to the kernel. Does not return.
#[entry]
fn main() -> ! {
    let Some(mut cp) = cortex_m::Peripherals::take() else {
        fatal!("core peripherals already taken");
    };

    // Logging first so kernel diagnostics reach the debugger
    if cortex_m4::init_logger(cp.ITM, LevelFilter::Info).is_err() {
        fatal!("logger installed twice");
    }
    cortex_m4::configure_systick(&mut cp.SYST, &mut cp.SCB);

    let mut kernel: Kernel<World> = Kernel::new();
    let mut world = World {
        frames: AsyncQueue::new(&mut kernel),
        next_seq: 0,
        shutter: kernel.new_signal(),
        in_hand: None,
        checker: kernel.spawn(),
        checked: kernel.new_signal(),
        checksum: 0,
    };

    let consume = kernel.spawn();
    let produce = kernel.spawn();
    kernel.start(consume, consumer, 0, None);
    kernel.start(produce, producer, 0, None);

    info!("pipeline started, {} frame slots", QUEUE_DEPTH);
    kernel.run(&mut world, &mut CortexM4)
}
