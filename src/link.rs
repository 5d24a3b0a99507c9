//! # Link Protocol
//!
//! Full-duplex, flow-controlled packet link over an SPI-like bus. Every
//! transfer moves bytes in both directions at once, so one transfer round
//! carries at most one outbound and one inbound packet together.
//!
//! ## Wire format
//!
//! ```text
//!   byte 0..2   payload length (u16, little endian)
//!   byte 2..4   routing header (u16, little endian, packed LSB first)
//!                 bits 0..3   destination
//!                 bits 3..6   source
//!                 bit  6      last packet
//!                 bit  7      reserved
//!                 bits 8..14  function
//!                 bits 14..16 version
//!   byte 4..    payload (up to LINK_MTU bytes)
//! ```
//!
//! ## Transfer round
//!
//! ```text
//!   Idle ──► HeaderPhase ──► PayloadHeadPhase ──► PayloadTailPhase ──► Idle
//!            4 bytes, CS kept  head bytes          rest, rounded up,
//!                                                  CS released
//! ```
//!
//! Flow control is out of band: the link drives a local ready-to-send line
//! and watches the peer's one through [`LinkEvents::PEER_READY`].

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::config::{LINK_HEADER_LENGTH, LINK_MTU, LINK_TRANSFER_GRANULARITY, PROTOCOL_VERSION};
use crate::error::LinkError;
use crate::fatal;
use crate::group::{GroupId, WaitMode};
use crate::kernel::{Kernel, TaskCx};
use crate::resume_points;
use crate::signal::SignalId;
use crate::task::{Label, Step};

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Nodes reachable through the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Target {
    Stm32 = 0x01,
    Esp32 = 0x02,
    WifiHost = 0x03,
    Gap = 0x04,
}

impl Target {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Target::Stm32),
            0x02 => Some(Target::Esp32),
            0x03 => Some(Target::WifiHost),
            0x04 => Some(Target::Gap),
            _ => None,
        }
    }
}

/// Application-level service a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Function {
    System = 0x01,
    Console = 0x02,
    Crtp = 0x03,
    WifiCtrl = 0x04,
    App = 0x05,
    Streamer = 0x06,
    Test = 0x0E,
    Bootloader = 0x0F,
}

impl Function {
    /// Number of function slots a router dispatches on.
    pub const SLOTS: usize = 16;

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(Function::System),
            0x02 => Some(Function::Console),
            0x03 => Some(Function::Crtp),
            0x04 => Some(Function::WifiCtrl),
            0x05 => Some(Function::App),
            0x06 => Some(Function::Streamer),
            0x0E => Some(Function::Test),
            0x0F => Some(Function::Bootloader),
            _ => None,
        }
    }
}

/// Routing information carried in every packet header.
///
/// Fields hold the raw wire values; unknown targets or functions are
/// preserved so a router can report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingHeader {
    pub destination: u8,
    pub source: u8,
    pub last_packet: bool,
    pub function: u8,
    pub version: u8,
}

impl RoutingHeader {
    pub const fn new(source: Target, destination: Target, function: Function) -> Self {
        Self {
            destination: destination as u8,
            source: source as u8,
            last_packet: true,
            function: function as u8,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn pack(self) -> u16 {
        (self.destination as u16 & 0x07)
            | (self.source as u16 & 0x07) << 3
            | (self.last_packet as u16) << 6
            | (self.function as u16 & 0x3f) << 8
            | (self.version as u16 & 0x03) << 14
    }

    pub fn unpack(raw: u16) -> Self {
        Self {
            destination: (raw & 0x07) as u8,
            source: ((raw >> 3) & 0x07) as u8,
            last_packet: raw & (1 << 6) != 0,
            function: ((raw >> 8) & 0x3f) as u8,
            version: (raw >> 14) as u8,
        }
    }

    pub fn target(&self) -> Option<Target> {
        Target::from_raw(self.destination)
    }

    pub fn function(&self) -> Option<Function> {
        Function::from_raw(self.function)
    }
}

/// The fixed header exchanged at the start of every transfer round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkHeader {
    /// Payload length in bytes.
    pub length: u16,
    pub routing: RoutingHeader,
}

impl LinkHeader {
    /// Sent when there is nothing to say.
    pub const EMPTY: [u8; LINK_HEADER_LENGTH] = [0; LINK_HEADER_LENGTH];

    pub fn to_bytes(self) -> [u8; LINK_HEADER_LENGTH] {
        let length = self.length.to_le_bytes();
        let routing = self.routing.pack().to_le_bytes();
        [length[0], length[1], routing[0], routing[1]]
    }

    pub fn from_bytes(bytes: [u8; LINK_HEADER_LENGTH]) -> Self {
        Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            routing: RoutingHeader::unpack(u16::from_le_bytes([bytes[2], bytes[3]])),
        }
    }
}

/// Round `length` up to the bus transfer granularity.
#[inline]
pub const fn round_up(length: usize) -> usize {
    let rem = length % LINK_TRANSFER_GRANULARITY;
    if rem == 0 {
        length
    } else {
        length + LINK_TRANSFER_GRANULARITY - rem
    }
}

// ---------------------------------------------------------------------------
// Buffers and requests
// ---------------------------------------------------------------------------

/// Byte buffer aligned for the bus.
#[repr(C, align(4))]
pub struct PacketBuffer<const N: usize>([u8; N]);

impl<const N: usize> PacketBuffer<N> {
    const GRANULAR: () = assert!(N % LINK_TRANSFER_GRANULARITY == 0, "buffer size must be a multiple of 4");

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::GRANULAR;
        Self([0; N])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const N: usize> Default for PacketBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> core::ops::Deref for PacketBuffer<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> core::ops::DerefMut for PacketBuffer<N> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

fn check_chunk(what: &str, buffer: &[u8], length: usize) {
    if length % LINK_TRANSFER_GRANULARITY != 0 {
        fatal!("{} length {} is not a multiple of {} bytes", what, length, LINK_TRANSFER_GRANULARITY);
    }
    if length > buffer.len() {
        fatal!("{} length {} exceeds its {} byte buffer", what, length, buffer.len());
    }
    if length > 0 && buffer.as_ptr() as usize % LINK_TRANSFER_GRANULARITY != 0 {
        fatal!("{} buffer {:p} is not 4-byte aligned", what, buffer.as_ptr());
    }
}

fn check_total(head_length: usize, tail_length: usize) -> u16 {
    let total = head_length + tail_length;
    if total > LINK_MTU {
        fatal!(
            "packet length ({} + {} bytes) exceeds the {} byte MTU",
            head_length,
            tail_length,
            LINK_MTU
        );
    }
    total as u16
}

/// An outbound packet, split in two parts so senders can avoid copies.
///
/// The two parts are sent back to back; the split is invisible on the wire.
/// Both buffers are owned by the request until it is handed back by
/// [`Link::take_sent`].
pub struct SendRequest {
    header: LinkHeader,
    head: &'static mut [u8],
    head_length: usize,
    tail: &'static mut [u8],
    tail_length: usize,
}

impl SendRequest {
    /// Both parts are sent in full.
    pub fn new(routing: RoutingHeader, head: &'static mut [u8], tail: &'static mut [u8]) -> Self {
        let (head_length, tail_length) = (head.len(), tail.len());
        check_chunk("head", head, head_length);
        check_chunk("tail", tail, tail_length);
        let length = check_total(head_length, tail_length);

        Self {
            header: LinkHeader { length, routing },
            head,
            head_length,
            tail,
            tail_length,
        }
    }

    /// Replace the head buffer, returning the previous one.
    pub fn set_head(&mut self, head: &'static mut [u8], length: usize) -> &'static mut [u8] {
        check_chunk("head", head, length);
        self.header.length = check_total(length, self.tail_length);
        self.head_length = length;
        core::mem::replace(&mut self.head, head)
    }

    /// Send only the first `length` bytes of the head buffer.
    pub fn set_head_length(&mut self, length: usize) {
        check_chunk("head", self.head, length);
        self.header.length = check_total(length, self.tail_length);
        self.head_length = length;
    }

    /// Replace the tail buffer, returning the previous one.
    pub fn set_tail(&mut self, tail: &'static mut [u8], length: usize) -> &'static mut [u8] {
        check_chunk("tail", tail, length);
        self.header.length = check_total(self.head_length, length);
        self.tail_length = length;
        core::mem::replace(&mut self.tail, tail)
    }

    pub fn set_tail_length(&mut self, length: usize) {
        check_chunk("tail", self.tail, length);
        self.header.length = check_total(self.head_length, length);
        self.tail_length = length;
    }

    /// Longest tail that still fits next to the current head.
    pub fn max_tail_length(&self) -> usize {
        let room = LINK_MTU - self.head_length;
        room - room % LINK_TRANSFER_GRANULARITY
    }

    pub fn set_routing(&mut self, routing: RoutingHeader) {
        self.header.routing = routing;
    }

    #[inline]
    pub fn header(&self) -> LinkHeader {
        self.header
    }

    /// Whole head buffer, for filling in place.
    pub fn head_mut(&mut self) -> &mut [u8] {
        self.head
    }

    pub fn tail_mut(&mut self) -> &mut [u8] {
        self.tail
    }

    pub fn head(&self) -> &[u8] {
        &self.head[..self.head_length]
    }

    pub fn tail(&self) -> &[u8] {
        &self.tail[..self.tail_length]
    }

    pub fn into_buffers(self) -> (&'static mut [u8], &'static mut [u8]) {
        (self.head, self.tail)
    }
}

impl core::fmt::Debug for SendRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendRequest")
            .field("header", &self.header)
            .field("head_length", &self.head_length)
            .field("tail_length", &self.tail_length)
            .finish()
    }
}

/// A slot for one inbound packet.
pub struct ReceiveRequest {
    header: LinkHeader,
    buffer: &'static mut [u8],
}

impl ReceiveRequest {
    /// `buffer` must hold at least [`LINK_MTU`] bytes: a transfer clocks in
    /// as many bytes as the longer of the two directions.
    pub fn new(buffer: &'static mut [u8]) -> Self {
        Self {
            header: LinkHeader::default(),
            buffer,
        }
    }

    /// Header of the last packet received into this slot.
    #[inline]
    pub fn header(&self) -> LinkHeader {
        self.header
    }

    /// Payload of the last packet received. Empty for a "nothing" packet.
    pub fn payload(&self) -> &[u8] {
        let length = (self.header.length as usize).min(self.buffer.len());
        &self.buffer[..length]
    }

    pub fn into_buffer(self) -> &'static mut [u8] {
        self.buffer
    }
}

impl core::fmt::Debug for ReceiveRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReceiveRequest")
            .field("header", &self.header)
            .field("capacity", &self.buffer.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// What happens to chip select once a transfer ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipSelect {
    /// Stay asserted; the next transfer continues the same transaction.
    Keep,
    /// Deassert; the transaction is over.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Finished before `transfer` returned.
    Complete,
    /// Still running. The bus completion interrupt must fire the link's
    /// [`transfer_signal`](Link::transfer_signal), typically through an
    /// [`IrqMailbox`](crate::sync::IrqMailbox) bound to it.
    InFlight,
}

/// Full-duplex bus plus the two flow-control lines.
pub trait LinkBus {
    /// Clock `len` bytes in both directions.
    ///
    /// Bytes past the end of `tx` are sent as zero; bytes past the end of
    /// `rx` are discarded. Both slices stay untouched by the link until the
    /// transfer completes.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8], len: usize, cs: ChipSelect) -> TransferStatus;

    /// Drive the local ready-to-send line.
    fn set_ready_to_send(&mut self, ready: bool);

    /// Watch for the next rising edge of the peer's ready-to-send line.
    fn rearm_peer_ready(&mut self) {}
}

bitflags! {
    /// Conditions the link task waits on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkEvents: u32 {
        /// The peer has raised its ready-to-send line.
        const PEER_READY = 1 << 0;
        /// A send request is pending.
        const SEND = 1 << 1;
        /// A receive slot is posted.
        const RECEIVE = 1 << 2;
    }
}

// ---------------------------------------------------------------------------
// Transfer planning
// ---------------------------------------------------------------------------

/// One payload phase of a transfer round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing to clock; complete immediately.
    Skip,
    /// Nothing to clock, but chip select must still be released: send an
    /// empty header the peer ignores.
    Dummy,
    Transfer { len: usize, cs: ChipSelect },
}

/// Longer of the two directions, inbound clamped to the MTU.
#[inline]
fn total_length(send_length: usize, receive_length: usize) -> usize {
    send_length.max(receive_length.min(LINK_MTU))
}

/// Head phase: the send request's head, with as many inbound bytes.
pub fn plan_head(send_length: usize, head_length: usize, receive_length: usize) -> Phase {
    let total = total_length(send_length, receive_length);
    let end_of_transfer = total == head_length;
    let cs = if end_of_transfer {
        ChipSelect::Release
    } else {
        ChipSelect::Keep
    };

    match (head_length, end_of_transfer) {
        (0, true) => Phase::Dummy,
        (0, false) => Phase::Skip,
        (len, _) => Phase::Transfer { len, cs },
    }
}

/// Tail phase: whatever is left of the longer direction.
pub fn plan_tail(send_length: usize, head_length: usize, receive_length: usize) -> Phase {
    let total = total_length(send_length, receive_length);
    match total.saturating_sub(head_length) {
        0 => Phase::Skip,
        remaining => Phase::Transfer {
            len: round_up(remaining),
            cs: ChipSelect::Release,
        },
    }
}

/// The part of `buffer` a phase may write: `len` bytes from `offset`,
/// clamped to the buffer.
fn window(buffer: &mut [u8], offset: usize, len: usize) -> &mut [u8] {
    let start = offset.min(buffer.len());
    let end = offset.saturating_add(len).min(buffer.len());
    &mut buffer[start..end]
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    HeaderPhase,
    PayloadHeadPhase,
    PayloadTailPhase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Completed transfer rounds.
    pub transfers: u32,
    pub sent: u32,
    /// Non-empty packets delivered.
    pub received: u32,
    /// Inbound packets dropped as corrupt.
    pub dropped: u32,
}

pub struct Link<B> {
    bus: B,
    events: GroupId,
    transfer_done: SignalId,
    state: LinkState,

    send: Option<SendRequest>,
    send_done: Option<SignalId>,
    sent: Option<SendRequest>,

    receive: Option<ReceiveRequest>,
    receive_done: Option<SignalId>,
    received: Option<ReceiveRequest>,

    // Snapshot of the current round
    carry_send: bool,
    carry_receive: bool,
    inbound_length: usize,
    tx_header: [u8; LINK_HEADER_LENGTH],
    rx_header: [u8; LINK_HEADER_LENGTH],

    stats: LinkStats,
}

impl<B: LinkBus> Link<B> {
    /// Allocate the link's condition group and transfer signal.
    pub fn new<W>(kernel: &mut Kernel<W>, bus: B) -> Self {
        Self {
            bus,
            events: kernel.new_group(),
            transfer_done: kernel.new_signal(),
            state: LinkState::Idle,
            send: None,
            send_done: None,
            sent: None,
            receive: None,
            receive_done: None,
            received: None,
            carry_send: false,
            carry_receive: false,
            inbound_length: 0,
            tx_header: LinkHeader::EMPTY,
            rx_header: LinkHeader::EMPTY,
            stats: LinkStats::default(),
        }
    }

    /// Group holding the [`LinkEvents`]. Bind the peer-ready interrupt here.
    #[inline]
    pub fn events(&self) -> GroupId {
        self.events
    }

    /// Signal fired when a bus transfer completes.
    #[inline]
    pub fn transfer_signal(&self) -> SignalId {
        self.transfer_done
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[inline]
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Queue `request` for the next transfer round; `done` fires once it is
    /// on the wire. The caller arms `done` beforehand.
    ///
    /// One send may be outstanding at a time, including a completed one not
    /// yet collected with [`take_sent`](Self::take_sent).
    pub fn send_async<W>(&mut self, kernel: &mut Kernel<W>, request: SendRequest, done: SignalId) {
        if self.send.is_some() || self.sent.is_some() {
            fatal!("multiple send requests in progress");
        }

        trace!("send request of {} bytes", request.header.length);
        self.send = Some(request);
        self.send_done = Some(done);
        kernel.group_set(self.events, LinkEvents::SEND.bits());
    }

    /// Post a receive slot; `done` fires after the next transfer round.
    pub fn receive_async<W>(&mut self, kernel: &mut Kernel<W>, request: ReceiveRequest, done: SignalId) {
        if self.receive.is_some() || self.received.is_some() {
            fatal!("multiple receive requests in progress");
        }
        if request.buffer.len() < LINK_MTU {
            fatal!(
                "receive buffer of {} bytes cannot hold every packet size ({} bytes)",
                request.buffer.len(),
                LINK_MTU
            );
        }
        if request.buffer.as_ptr() as usize % LINK_TRANSFER_GRANULARITY != 0 {
            fatal!("receive buffer {:p} is not 4-byte aligned", request.buffer.as_ptr());
        }

        self.receive = Some(request);
        self.receive_done = Some(done);
        kernel.group_set(self.events, LinkEvents::RECEIVE.bits());
    }

    /// Collect a completed send request.
    pub fn take_sent(&mut self) -> Option<SendRequest> {
        self.sent.take()
    }

    /// Collect a completed receive request.
    pub fn take_received(&mut self) -> Option<ReceiveRequest> {
        self.received.take()
    }

    // --- Transfer round ---

    fn begin_round(&mut self, snapshot: LinkEvents) {
        self.carry_send = snapshot.contains(LinkEvents::SEND) && self.send.is_some();
        self.carry_receive = snapshot.contains(LinkEvents::RECEIVE) && self.receive.is_some();
        self.inbound_length = 0;
        self.tx_header = match (&self.send, self.carry_send) {
            (Some(request), true) => request.header.to_bytes(),
            _ => LinkHeader::EMPTY,
        };
        self.rx_header = LinkHeader::EMPTY;
        self.state = LinkState::HeaderPhase;

        debug!(
            "transfer round: send {}, receive {}",
            self.carry_send, self.carry_receive
        );
    }

    fn transfer_header(&mut self) -> TransferStatus {
        let rx: &mut [u8] = if self.carry_receive {
            &mut self.rx_header
        } else {
            &mut []
        };
        self.bus.transfer(&self.tx_header, rx, LINK_HEADER_LENGTH, ChipSelect::Keep)
    }

    fn latch_receive_header(&mut self) {
        if !self.carry_receive {
            return;
        }
        if let Some(request) = self.receive.as_mut() {
            request.header = LinkHeader::from_bytes(self.rx_header);
            self.inbound_length = request.header.length as usize;
        }
    }

    /// Outbound `(total, head)` lengths of this round.
    fn outbound(&self) -> (usize, usize) {
        match (&self.send, self.carry_send) {
            (Some(request), true) => (request.header.length as usize, request.head_length),
            _ => (0, 0),
        }
    }

    fn transfer_head(&mut self) -> Option<TransferStatus> {
        self.state = LinkState::PayloadHeadPhase;
        let (send_length, head_length) = self.outbound();
        let phase = plan_head(send_length, head_length, self.inbound_length);
        debug!(
            "head phase: out {}, head {}, in {}: {:?}",
            send_length, head_length, self.inbound_length, phase
        );

        match phase {
            Phase::Skip => None,
            Phase::Dummy => Some(self.bus.transfer(
                &LinkHeader::EMPTY,
                &mut [],
                LINK_HEADER_LENGTH,
                ChipSelect::Release,
            )),
            Phase::Transfer { len, cs } => {
                let tx: &[u8] = match (&self.send, self.carry_send) {
                    (Some(request), true) => request.head(),
                    _ => &[],
                };
                let rx: &mut [u8] = match (&mut self.receive, self.carry_receive) {
                    (Some(request), true) => window(request.buffer, 0, len),
                    _ => &mut [],
                };
                Some(self.bus.transfer(tx, rx, len, cs))
            }
        }
    }

    fn transfer_tail(&mut self) -> Option<TransferStatus> {
        self.state = LinkState::PayloadTailPhase;
        let (send_length, head_length) = self.outbound();
        let phase = plan_tail(send_length, head_length, self.inbound_length);
        debug!("tail phase: {:?}", phase);

        match phase {
            Phase::Skip | Phase::Dummy => None,
            Phase::Transfer { len, cs } => {
                let tx: &[u8] = match (&self.send, self.carry_send) {
                    (Some(request), true) => request.tail(),
                    _ => &[],
                };
                let rx: &mut [u8] = match (&mut self.receive, self.carry_receive) {
                    (Some(request), true) => window(request.buffer, head_length, len),
                    _ => &mut [],
                };
                Some(self.bus.transfer(tx, rx, len, cs))
            }
        }
    }

    /// Wait for the phase just started. A skipped phase completes at once.
    fn await_transfer<W, L: Label>(&self, cx: &mut TaskCx<'_, W>, status: Option<TransferStatus>, at: L) -> Step {
        cx.arm(self.transfer_done);
        match status {
            None | Some(TransferStatus::Complete) => cx.fire(self.transfer_done),
            Some(TransferStatus::InFlight) => {}
        }
        cx.wait(self.transfer_done, at)
    }

    fn complete_round<W>(&mut self, kernel: &mut Kernel<W>) {
        self.state = LinkState::Idle;
        self.stats.transfers += 1;

        if self.carry_send {
            if let Some(request) = self.send.take() {
                self.sent = Some(request);
                self.stats.sent += 1;
                kernel.group_clear(self.events, LinkEvents::SEND.bits());
                if let Some(done) = self.send_done.take() {
                    kernel.fire(done);
                }
            }
        }

        if self.carry_receive {
            if let Some(mut request) = self.receive.take() {
                let declared = request.header.length;
                if declared as usize > LINK_MTU {
                    let err = LinkError::Oversized { declared, max: LINK_MTU };
                    warn!("dropping inbound packet: {}", err);
                    self.stats.dropped += 1;
                    request.header.length = 0;
                } else if declared > 0 {
                    self.stats.received += 1;
                }

                self.received = Some(request);
                kernel.group_clear(self.events, LinkEvents::RECEIVE.bits());
                if let Some(done) = self.receive_done.take() {
                    kernel.fire(done);
                }
            }
        }

        self.carry_send = false;
        self.carry_receive = false;
    }
}

impl<B> core::fmt::Debug for Link<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Link")
            .field("state", &self.state)
            .field("send", &self.send)
            .field("receive", &self.receive)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Application world that owns a [`Link`].
pub trait LinkHost {
    type Bus: LinkBus;

    fn link(&mut self) -> &mut Link<Self::Bus>;
}

resume_points! {
    enum Await { Activity, ReceiveSlot, PeerReady, Header, Head, Tail }
}

/// The link's driver task. Start it once on a dedicated context.
///
/// ```ignore
/// let task = kernel.spawn();
/// kernel.start(task, link_task::<World>, 0, None);
/// ```
pub fn link_task<W: LinkHost>(world: &mut W, cx: &mut TaskCx<'_, W>) -> Step {
    let link = world.link();
    let events = link.events;
    let mut resumed = cx.resumed_at::<Await>();

    loop {
        match resumed.take() {
            // 1) Wait until either side wants to transmit
            None => {
                link.state = LinkState::Idle;
                let interest = LinkEvents::PEER_READY | LinkEvents::SEND;
                return cx.wait_group(events, interest.bits(), WaitMode::Any, Await::Activity);
            }

            // 2) A transfer always clocks bytes in, so wait for a receive slot
            Some(Await::Activity) => {
                return cx.wait_group(events, LinkEvents::RECEIVE.bits(), WaitMode::All, Await::ReceiveSlot);
            }

            // 3) Announce a pending send, then 4) wait for the peer even if it
            //    was ready at 1), coalescing any send requested meanwhile
            Some(Await::ReceiveSlot) => {
                if cx.group_get(events, LinkEvents::SEND.bits()) != 0 {
                    link.bus.set_ready_to_send(true);
                }
                return cx.wait_group(events, LinkEvents::PEER_READY.bits(), WaitMode::All, Await::PeerReady);
            }

            // 5) Snapshot every condition at once, 6) exchange headers
            Some(Await::PeerReady) => {
                let snapshot = LinkEvents::from_bits_truncate(cx.group_get(events, LinkEvents::all().bits()));
                link.begin_round(snapshot);
                let status = link.transfer_header();
                return link.await_transfer(cx, Some(status), Await::Header);
            }

            // 7) Drop ready-to-send and re-arm the peer edge before the payload
            //    moves, 8) transfer the head
            Some(Await::Header) => {
                link.bus.set_ready_to_send(false);
                cx.group_clear(events, LinkEvents::PEER_READY.bits());
                link.bus.rearm_peer_ready();
                link.latch_receive_header();

                let status = link.transfer_head();
                return link.await_transfer(cx, status, Await::Head);
            }

            // 9) Transfer the tail
            Some(Await::Head) => {
                let status = link.transfer_tail();
                return link.await_transfer(cx, status, Await::Tail);
            }

            // 10) Hand both requests back
            Some(Await::Tail) => {
                link.complete_round(cx);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
