//! # Packet Router
//!
//! Function-based dispatch on top of a [`Link`]. The router keeps one
//! receive buffer cycling through the link and hands each inbound packet to
//! the handler task registered for its [`Function`]. On the way out it
//! serializes any number of senders onto the link's single send slot.
//!
//! ```text
//!            ┌────────── receive task ──────────┐
//!   Link ──► │ version check ─► lookup handler  │ ──► handler task
//!            └──────────────────────────────────┘     reads Router::packet()
//!
//!   submit() ──► send task (slot i) ──┐
//!   submit() ──► send task (slot j) ──┼─ send_free lock ─► Link::send_async
//!                                     ┘                   fires slot_done[i]
//! ```
//!
//! `send_free` is only a lock. Send tasks take it with
//! `while !is_done(send_free) { wait }` and arm it. The link reports
//! completion on the slot's own signal, and the holder fires `send_free`
//! again once it has collected the request with `Link::take_sent`. Until
//! then the link's send slot is still occupied. Waiters wake in FIFO order,
//! so senders get the link in arrival order.

use log::{trace, warn};

use crate::config::{PROTOCOL_VERSION, ROUTER_SEND_SLOTS};
use crate::error::LinkError;
use crate::fatal;
use crate::kernel::{Kernel, TaskCx};
use crate::link::{Function, Link, LinkHost, ReceiveRequest, RoutingHeader, SendRequest};
use crate::resume_points;
use crate::signal::SignalId;
use crate::task::{Step, TaskFn, TaskId};

/// A received packet, as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'r> {
    pub routing: RoutingHeader,
    pub payload: &'r [u8],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Packets handed to a handler that ran to completion.
    pub dispatched: u32,
    /// Packets dropped for lack of a handler.
    pub unrouted: u32,
    pub version_mismatches: u32,
}

/// Application world that owns a [`Router`] next to its [`Link`].
pub trait RouterHost: LinkHost + Sized {
    fn split(&mut self) -> (&mut Router<Self>, &mut Link<Self::Bus>);
}

pub struct Router<W> {
    handlers: [Option<TaskFn<W>>; Function::SLOTS],
    handler_task: TaskId,
    handler_done: SignalId,

    receive_task: TaskId,
    receive_done: SignalId,
    /// Receive buffer while it is not lent to the link.
    idle: Option<ReceiveRequest>,
    /// Packet being handled.
    current: Option<ReceiveRequest>,

    /// Lock over the link's send slot.
    send_free: SignalId,
    /// Link completion, per slot.
    slot_done: [SignalId; ROUTER_SEND_SLOTS],
    send_tasks: [TaskId; ROUTER_SEND_SLOTS],
    outbox: [Option<SendRequest>; ROUTER_SEND_SLOTS],
    sent: [Option<SendRequest>; ROUTER_SEND_SLOTS],

    stats: RouterStats,
}

impl<W: RouterHost> Router<W> {
    /// Allocate the router's contexts and signals. `buffer` is the receive
    /// buffer and must hold [`LINK_MTU`](crate::config::LINK_MTU) bytes.
    pub fn new(kernel: &mut Kernel<W>, buffer: &'static mut [u8]) -> Self {
        let send_free = kernel.new_signal();
        kernel.fire(send_free);

        Self {
            handlers: [None; Function::SLOTS],
            handler_task: kernel.spawn(),
            handler_done: kernel.new_signal(),
            receive_task: kernel.spawn(),
            receive_done: kernel.new_signal(),
            idle: Some(ReceiveRequest::new(buffer)),
            current: None,
            send_free,
            slot_done: core::array::from_fn(|_| kernel.new_signal()),
            send_tasks: core::array::from_fn(|_| kernel.spawn()),
            outbox: core::array::from_fn(|_| None),
            sent: core::array::from_fn(|_| None),
            stats: RouterStats::default(),
        }
    }

    /// Start the receive loop.
    pub fn start(&self, kernel: &mut Kernel<W>) {
        kernel.start(self.receive_task, receive_task::<W>, 0, None);
    }

    /// Route packets for `function` to `handler`.
    ///
    /// The handler runs as a task with the raw function number as its
    /// argument. The packet stays readable through [`packet`](Self::packet)
    /// until the handler returns [`Step::DONE`]; it may suspend meanwhile.
    pub fn register(&mut self, function: Function, handler: TaskFn<W>) {
        let slot = &mut self.handlers[function as usize];
        if slot.is_some() {
            fatal!("handler for function {:?} registered twice", function);
        }
        *slot = Some(handler);
    }

    /// The packet currently being handled.
    pub fn packet(&self) -> Option<Packet<'_>> {
        self.current.as_ref().map(|request| Packet {
            routing: request.header().routing,
            payload: request.payload(),
        })
    }

    /// Queue `request` for sending, returning its slot. `done` fires once
    /// the request is back and can be collected with
    /// [`take_sent`](Self::take_sent).
    pub fn submit(&mut self, kernel: &mut Kernel<W>, request: SendRequest, done: SignalId) -> usize {
        let free = (0..ROUTER_SEND_SLOTS).find(|&slot| {
            self.outbox[slot].is_none() && self.sent[slot].is_none() && !kernel.context(self.send_tasks[slot]).is_live()
        });
        let Some(slot) = free else {
            fatal!("all {} router send slots busy", ROUTER_SEND_SLOTS);
        };

        trace!("router send slot {} for function {}", slot, request.header().routing.function);
        self.outbox[slot] = Some(request);
        kernel.arm(done);
        kernel.start(self.send_tasks[slot], send_task::<W>, slot, Some(done));
        slot
    }

    /// Collect the request sent from `slot`.
    pub fn take_sent(&mut self, slot: usize) -> Option<SendRequest> {
        self.sent.get_mut(slot).and_then(Option::take)
    }

    #[inline]
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    fn route(&mut self, request: &ReceiveRequest) -> Result<Option<TaskFn<W>>, LinkError> {
        let header = request.header();
        if header.length == 0 {
            return Ok(None);
        }

        let routing = header.routing;
        if routing.version != PROTOCOL_VERSION {
            self.stats.version_mismatches += 1;
            return Err(LinkError::UnsupportedVersion {
                found: routing.version,
                expected: PROTOCOL_VERSION,
            });
        }

        match self.handlers.get(routing.function as usize).copied().flatten() {
            Some(handler) => Ok(Some(handler)),
            None => {
                self.stats.unrouted += 1;
                Err(LinkError::Unrouted {
                    function: routing.function,
                })
            }
        }
    }
}

impl<W> core::fmt::Debug for Router<W> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("handlers", &self.handlers.iter().filter(|h| h.is_some()).count())
            .field("current", &self.current)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

resume_points! {
    enum Inbound { Delivered, Handled }
}

fn receive_task<W: RouterHost>(world: &mut W, cx: &mut TaskCx<'_, W>) -> Step {
    let (router, link) = world.split();
    let mut resumed = cx.resumed_at::<Inbound>();

    loop {
        match resumed.take() {
            None => {
                let Some(request) = router.idle.take() else {
                    fatal!("router receive buffer is already lent out");
                };
                cx.arm(router.receive_done);
                link.receive_async(cx, request, router.receive_done);
                return cx.wait(router.receive_done, Inbound::Delivered);
            }

            Some(Inbound::Delivered) => {
                let Some(request) = link.take_received() else {
                    fatal!("receive completed without returning the request");
                };

                match router.route(&request) {
                    Ok(Some(handler)) => {
                        let function = request.header().routing.function;
                        router.current = Some(request);
                        cx.arm(router.handler_done);
                        cx.start(router.handler_task, handler, function as usize, Some(router.handler_done));
                        return cx.wait(router.handler_done, Inbound::Handled);
                    }
                    Ok(None) => router.idle = Some(request),
                    Err(err) => {
                        warn!("dropping packet: {}", err);
                        router.idle = Some(request);
                    }
                }
            }

            Some(Inbound::Handled) => {
                router.idle = router.current.take();
                router.stats.dispatched += 1;
            }
        }
    }
}

resume_points! {
    enum Outbound { Free, Sent }
}

fn send_task<W: RouterHost>(world: &mut W, cx: &mut TaskCx<'_, W>) -> Step {
    let slot = cx.arg();
    let (router, link) = world.split();

    match cx.resumed_at::<Outbound>() {
        None | Some(Outbound::Free) => {
            if !cx.is_done(router.send_free) {
                return cx.wait(router.send_free, Outbound::Free);
            }

            cx.arm(router.send_free);
            let Some(request) = router.outbox[slot].take() else {
                fatal!("router send slot {} started without a request", slot);
            };
            let done = router.slot_done[slot];
            cx.arm(done);
            link.send_async(cx, request, done);
            cx.wait(done, Outbound::Sent)
        }

        Some(Outbound::Sent) => {
            router.sent[slot] = link.take_sent();
            if router.sent[slot].is_none() {
                fatal!("send completed without returning the request");
            }
            // The link's send slot is empty again
            cx.fire(router.send_free);
            Step::DONE
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LINK_MTU;
    use crate::link::{
        link_task, ChipSelect, LinkBus, LinkEvents, LinkHeader, LinkState, PacketBuffer, Target,
        TransferStatus,
    };
    use std::collections::VecDeque;

    #[derive(Default)]
    struct PeerBus {
        peer: VecDeque<u8>,
        /// Outbound headers, one per transfer round.
        headers: Vec<LinkHeader>,
        in_header: bool,
    }

    impl PeerBus {
        fn announce(&mut self, routing: RoutingHeader, payload: &[u8]) {
            let header = LinkHeader {
                length: payload.len() as u16,
                routing,
            };
            self.peer.extend(header.to_bytes());
            self.peer.extend(payload.iter().copied());
        }
    }

    impl LinkBus for PeerBus {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8], len: usize, cs: ChipSelect) -> TransferStatus {
            // The header is the first transfer after chip select was released
            if !self.in_header {
                let mut bytes = [0; 4];
                bytes.copy_from_slice(&tx[..4]);
                self.headers.push(LinkHeader::from_bytes(bytes));
            }
            self.in_header = cs == ChipSelect::Keep;

            for i in 0..len {
                let byte = self.peer.pop_front().unwrap_or(0);
                if let Some(slot) = rx.get_mut(i) {
                    *slot = byte;
                }
            }
            TransferStatus::Complete
        }

        fn set_ready_to_send(&mut self, _ready: bool) {}
    }

    struct World {
        link: Link<PeerBus>,
        router: Router<World>,
        handled: Vec<(usize, Vec<u8>)>,
    }

    impl LinkHost for World {
        type Bus = PeerBus;

        fn link(&mut self) -> &mut Link<PeerBus> {
            &mut self.link
        }
    }

    impl RouterHost for World {
        fn split(&mut self) -> (&mut Router<World>, &mut Link<PeerBus>) {
            (&mut self.router, &mut self.link)
        }
    }

    fn leak<const N: usize>() -> &'static mut [u8] {
        Box::leak(Box::new(PacketBuffer::<N>::new())).as_mut_slice()
    }

    fn record(w: &mut World, cx: &mut TaskCx<'_, World>) -> Step {
        let payload = w.router.packet().expect("packet under dispatch").payload.to_vec();
        w.handled.push((cx.arg(), payload));
        Step::DONE
    }

    fn setup() -> (Kernel<World>, World) {
        let mut kernel = Kernel::new();
        let link = Link::new(&mut kernel, PeerBus::default());
        let mut router = Router::new(&mut kernel, leak::<LINK_MTU>());
        router.register(Function::Test, record);

        let task = kernel.spawn();
        kernel.start(task, link_task::<World>, 0, None);
        router.start(&mut kernel);

        let world = World {
            link,
            router,
            handled: Vec::new(),
        };
        (kernel, world)
    }

    fn peer_ready(kernel: &mut Kernel<World>, w: &World) {
        kernel.group_set(w.link.events(), LinkEvents::PEER_READY.bits());
    }

    fn inbound(function: Function) -> RoutingHeader {
        RoutingHeader::new(Target::WifiHost, Target::Gap, function)
    }

    fn outbound(fill: u8) -> SendRequest {
        sized::<8>(fill)
    }

    fn sized<const N: usize>(fill: u8) -> SendRequest {
        let head = leak::<N>();
        head.fill(fill);
        SendRequest::new(inbound(Function::App), head, leak::<0>())
    }

    #[test]
    fn test_dispatch_to_registered_handler() {
        let (mut kernel, mut w) = setup();
        w.link.bus_mut().announce(inbound(Function::Test), &[1, 2, 3, 4, 5]);
        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);

        assert_eq!(w.handled, vec![(Function::Test as usize, vec![1, 2, 3, 4, 5])]);
        assert_eq!(w.router.stats().dispatched, 1);
        assert!(w.router.packet().is_none());

        // Buffer is back with the link for the next packet
        let pending = kernel.group_get(w.link.events(), LinkEvents::RECEIVE.bits());
        assert_eq!(pending, LinkEvents::RECEIVE.bits());
    }

    #[test]
    fn test_unrouted_packet_is_dropped() {
        let (mut kernel, mut w) = setup();
        w.link.bus_mut().announce(inbound(Function::Console), &[9, 9, 9, 9]);
        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);

        assert!(w.handled.is_empty());
        assert_eq!(w.router.stats().unrouted, 1);
        assert_eq!(w.router.stats().dispatched, 0);
    }

    #[test]
    fn test_version_mismatch_is_dropped() {
        let (mut kernel, mut w) = setup();
        let mut routing = inbound(Function::Test);
        routing.version = 1;
        w.link.bus_mut().announce(routing, &[7, 7, 7, 7]);
        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);

        assert!(w.handled.is_empty());
        assert_eq!(w.router.stats().version_mismatches, 1);
    }

    #[test]
    fn test_empty_packets_are_not_dispatched() {
        let (mut kernel, mut w) = setup();
        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);

        assert!(w.handled.is_empty());
        assert_eq!(w.router.stats(), RouterStats::default());
    }

    #[test]
    fn test_sends_are_serialized_in_order() {
        let (mut kernel, mut w) = setup();
        let first = kernel.new_signal();
        let second = kernel.new_signal();

        let a = w.router.submit(&mut kernel, outbound(0xaa), first);
        let b = w.router.submit(&mut kernel, outbound(0xbb), second);
        assert_eq!((a, b), (0, 1));
        kernel.run_until_idle(&mut w);
        assert!(!kernel.is_done(first));

        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(first));
        assert!(!kernel.is_done(second));
        let sent = w.router.take_sent(a).expect("first request returned");
        assert_eq!(sent.head(), &[0xaa; 8]);

        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(second));
        assert_eq!(w.router.take_sent(b).expect("second request").head(), &[0xbb; 8]);

        let lengths: Vec<u16> = w.link.bus().headers.iter().map(|h| h.length).collect();
        assert_eq!(lengths, vec![8, 8]);
    }

    #[test]
    fn test_submit_while_send_completes() {
        let (mut kernel, mut w) = setup();
        let first = kernel.new_signal();
        let second = kernel.new_signal();

        let a = w.router.submit(&mut kernel, outbound(0xaa), first);
        peer_ready(&mut kernel, &w);

        // Stop right before the link hands the first request back
        let mut passes = 0;
        while w.link.state() != LinkState::PayloadTailPhase {
            kernel.run_once(&mut w);
            passes += 1;
            assert!(passes < 32, "link never reached the tail phase");
        }

        let b = w.router.submit(&mut kernel, outbound(0xbb), second);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(first));
        assert!(!kernel.is_done(second));
        assert_eq!(w.router.take_sent(a).expect("first request").head(), &[0xaa; 8]);

        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(second));
        assert_eq!(w.router.take_sent(b).expect("second request").head(), &[0xbb; 8]);
        assert_eq!(w.link.stats().sent, 2);
    }

    #[test]
    fn test_sender_queued_while_lock_is_held() {
        let (mut kernel, mut w) = setup();
        let done: Vec<SignalId> = (0..3).map(|_| kernel.new_signal()).collect();

        let a = w.router.submit(&mut kernel, sized::<4>(0x11), done[0]);
        let b = w.router.submit(&mut kernel, sized::<8>(0x22), done[1]);
        kernel.run_until_idle(&mut w);

        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(done[0]));
        assert!(!kernel.is_done(done[1]));

        // The second sender now holds the lock with its request on the link
        let c = w.router.submit(&mut kernel, sized::<12>(0x33), done[2]);
        kernel.run_until_idle(&mut w);
        assert!(!kernel.is_done(done[1]));
        assert!(!kernel.is_done(done[2]));

        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(done[1]));
        assert!(!kernel.is_done(done[2]));

        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(done[2]));

        assert_eq!(w.router.take_sent(a).expect("first").head(), &[0x11; 4]);
        assert_eq!(w.router.take_sent(b).expect("second").head(), &[0x22; 8]);
        assert_eq!(w.router.take_sent(c).expect("third").head(), &[0x33; 12]);

        let lengths: Vec<u16> = w.link.bus().headers.iter().map(|h| h.length).collect();
        assert_eq!(lengths, vec![4, 8, 12]);
    }

    #[test]
    fn test_collected_slot_is_reused() {
        let (mut kernel, mut w) = setup();
        let done = kernel.new_signal();
        let slot = w.router.submit(&mut kernel, outbound(1), done);
        peer_ready(&mut kernel, &w);
        kernel.run_until_idle(&mut w);
        assert!(kernel.is_done(done));

        // Not collected yet: the next submit takes another slot
        let next = kernel.new_signal();
        assert_eq!(w.router.submit(&mut kernel, outbound(2), next), 1);
        w.router.take_sent(slot).expect("sent request");
        let last = kernel.new_signal();
        assert_eq!(w.router.submit(&mut kernel, outbound(3), last), 0);
    }

    #[test]
    #[should_panic(expected = "router send slots busy")]
    fn test_submit_beyond_slots_is_fatal() {
        let (mut kernel, mut w) = setup();
        for fill in 0..=ROUTER_SEND_SLOTS as u8 {
            let done = kernel.new_signal();
            w.router.submit(&mut kernel, outbound(fill), done);
        }
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_handler_is_fatal() {
        let (_kernel, mut w) = setup();
        w.router.register(Function::Test, record);
    }
}
