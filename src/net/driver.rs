//! Transport abstraction — any asynchronous UDP/TCP driver.
//!
//! Every network operation here is strictly asynchronous: a call
//! starts the operation and returns an opaque handle; completion is
//! observed by polling the handle with the matching `check` call on a
//! later tick. A completed check frees the handle exactly once and
//! yields the operation result plus operation-specific data. Failing
//! to poll a completed handle leaks a descriptor; the leak is
//! observable through [`Driver::handles_outstanding`].
//!
//! Concrete implementations:
//! - [`StdNetDriver`](crate::adapters::std_net::StdNetDriver) —
//!   non-blocking `std::net` + `socket2` (the "modern" driver)
//! - a scriptable in-memory mock used by the integration tests
//!
//! The engines are generic over [`Driver`], so adding a new driver
//! requires zero changes to the state machines.
//!
//! ## Buffer ownership
//!
//! Received data is surfaced as a move-only token
//! ([`DatagramToken`], [`RdsBatch`]). The only way to dispose of a
//! token is the matching return-buffer call, so "buffer returned
//! before the next receive" is enforced by the type system rather
//! than by convention.

use core::fmt;
use std::net::Ipv4Addr;

use crate::net::asr::AsrRouter;

// ── Capacity limits ──────────────────────────────────────────

/// Stream slots a driver must provide (1 listen + pool + slack).
pub const MAX_TCP_STREAMS: usize = 8;

/// UDP endpoint slots a driver must provide.
pub const MAX_UDP_ENDPOINTS: usize = 2;

// ── Identifiers ──────────────────────────────────────────────

/// A TCP stream identity. A value, not a pointer: streams persist
/// from creation to release and are aborted between uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub u8);

/// A UDP endpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointId(pub u8);

/// Opaque handle to an in-flight TCP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandle(pub u8);

/// Opaque handle to an in-flight UDP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHandle(pub u8);

// ── Error taxonomy ───────────────────────────────────────────

/// Normalized driver error codes. Raw driver/OS codes are mapped
/// through this table at the abstraction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    NotInitialized,
    InvalidParam,
    /// No free descriptor, queue, or buffer. Callers must not retry
    /// tightly.
    OutOfMemory,
    Timeout,
    ConnectionFailed,
    ConnectionClosed,
    /// A slot for this operation kind is already occupied.
    Busy,
    NotSupported,
    Unknown,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "driver not initialized"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::OutOfMemory => write!(f, "out of descriptors or queue space"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::ConnectionFailed => write!(f, "connection failed"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Busy => write!(f, "operation slot busy"),
            Self::NotSupported => write!(f, "not supported by this driver"),
            Self::Unknown => write!(f, "unknown driver error"),
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;

// ── Completion polling ───────────────────────────────────────

/// Result of polling an async handle.
///
/// `Pending` leaves the handle allocated; any `Complete` value means
/// the handle has been freed by this call and must not be polled
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncPoll<T> {
    Pending,
    Complete(NetResult<T>),
}

impl<T> AsyncPoll<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Operation-specific completion data for TCP handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpCompletion {
    /// Passive open completed; a remote peer connected.
    Listen { remote_ip: Ipv4Addr, remote_port: u16 },
    Connect,
    Send,
    Close,
}

// ── Connection status ────────────────────────────────────────

/// TCP connection state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Listening,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl ConnState {
    /// True for established and every later (closing-side) state —
    /// the states in which a graceful close is meaningful.
    pub fn reached_established(self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::Listening | Self::SynSent | Self::SynReceived
        )
    }
}

/// Snapshot returned by [`Driver::tcp_status`].
#[derive(Debug, Clone, Copy)]
pub struct TcpStatus {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: ConnState,
    pub is_connected: bool,
    pub is_listening: bool,
}

// ── Zero-copy receive tokens ─────────────────────────────────

/// A received UDP datagram held in the driver-owned receive buffer.
///
/// Move-only; consumed by [`Driver::udp_return_buffer_async`]. The
/// application must not start a new receive on the endpoint until the
/// return completes.
#[derive(Debug)]
pub struct DatagramToken {
    endpoint: EndpointId,
    len: usize,
}

impl DatagramToken {
    /// Driver-side constructor.
    pub fn new(endpoint: EndpointId, len: usize) -> Self {
        Self { endpoint, len }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Data delivered by a completed UDP receive.
#[derive(Debug)]
pub struct UdpRecvInfo {
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub token: DatagramToken,
}

/// Received TCP data held in the stream's receive buffer; the
/// symmetric token for [`Driver::tcp_receive_no_copy`]. Consumed by
/// [`Driver::tcp_return_buffer`].
#[derive(Debug)]
pub struct RdsBatch {
    stream: StreamId,
    len: usize,
    entry_count: usize,
    pub urgent: bool,
    pub push_seen: bool,
}

impl RdsBatch {
    /// Driver-side constructor.
    pub fn new(stream: StreamId, len: usize, entry_count: usize, urgent: bool, push_seen: bool) -> Self {
        Self {
            stream,
            len,
            entry_count,
            urgent,
            push_seen,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

/// Descriptor pool occupancy, for leak assertions in soak tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleUsage {
    pub udp_in_use: usize,
    pub tcp_in_use: usize,
}

// ── The operations table ─────────────────────────────────────

/// Uniform asynchronous API over UDP/TCP primitives.
///
/// All methods run on the main loop. The one exception to the
/// synchronous-call rule is event delivery: a driver may report
/// network events (remote close, connection reset, ICMP) from a
/// foreign context by posting into the [`AsrRouter`] passed to
/// [`pump`](Self::pump); it must never call back into the engine.
pub trait Driver {
    // ── Lifecycle / utility ──────────────────────────────────

    /// The local IPv4 address chosen at initialization.
    fn local_ip(&self) -> Ipv4Addr;

    /// Progress internal I/O and post any pending network events.
    /// Called once at the top of every tick.
    fn pump(&mut self, router: &AsrRouter);

    /// Resolve a hostname to an IPv4 address.
    fn resolve(&mut self, hostname: &str) -> NetResult<Ipv4Addr>;

    fn implementation_name(&self) -> &'static str;

    /// Whether the underlying network stack is usable.
    fn is_available(&self) -> bool {
        true
    }

    /// Release every stream, endpoint, and descriptor.
    fn shutdown(&mut self);

    /// Current descriptor pool occupancy.
    fn handles_outstanding(&self) -> HandleUsage;

    // ── TCP ──────────────────────────────────────────────────

    /// Create a stream with a dedicated fixed-address receive buffer.
    fn tcp_create(&mut self) -> NetResult<StreamId>;

    fn tcp_release(&mut self, stream: StreamId) -> NetResult<()>;

    fn tcp_listen_async(&mut self, stream: StreamId, port: u16) -> NetResult<TcpHandle>;

    fn tcp_connect_async(&mut self, stream: StreamId, ip: Ipv4Addr, port: u16)
    -> NetResult<TcpHandle>;

    /// Start a send. `data` is copied into the descriptor's gather
    /// storage, which lives until the completing check frees the
    /// handle.
    fn tcp_send_async(&mut self, stream: StreamId, data: &[u8], push: bool)
    -> NetResult<TcpHandle>;

    /// Zero-timeout probe for already-arrived data. `Ok(None)` means
    /// nothing has arrived.
    fn tcp_receive_no_copy(
        &mut self,
        stream: StreamId,
        max_entries: usize,
    ) -> NetResult<Option<RdsBatch>>;

    /// Borrow the bytes behind a receive batch.
    fn rds_bytes<'a>(&'a self, batch: &RdsBatch) -> &'a [u8];

    /// Hand the receive buffers back to the driver.
    fn tcp_return_buffer(&mut self, stream: StreamId, batch: RdsBatch) -> NetResult<()>;

    fn tcp_close_async(&mut self, stream: StreamId) -> NetResult<TcpHandle>;

    /// Immediately tear down the connection (RST-style). Safe on an
    /// idle stream.
    fn tcp_abort(&mut self, stream: StreamId);

    fn tcp_status(&self, stream: StreamId) -> NetResult<TcpStatus>;

    /// Poll an in-flight TCP operation. A `Complete` return frees the
    /// handle (and any descriptor-owned gather storage) exactly once.
    fn tcp_check_async(&mut self, handle: TcpHandle) -> AsyncPoll<TcpCompletion>;

    /// Free the descriptor without waiting for the driver to finish.
    /// The underlying operation may still complete in the background;
    /// the driver guarantees the descriptor is not reused until it
    /// has quiesced.
    fn tcp_cancel_async(&mut self, handle: TcpHandle);

    // ── UDP ──────────────────────────────────────────────────

    /// Create an endpoint bound to `port` with a fixed-address
    /// receive buffer of `buffer_size` bytes.
    fn udp_create(&mut self, port: u16, buffer_size: usize) -> NetResult<EndpointId>;

    fn udp_release(&mut self, endpoint: EndpointId) -> NetResult<()>;

    fn udp_send_async(
        &mut self,
        endpoint: EndpointId,
        ip: Ipv4Addr,
        port: u16,
        payload: &[u8],
    ) -> NetResult<UdpHandle>;

    fn udp_receive_async(&mut self, endpoint: EndpointId) -> NetResult<UdpHandle>;

    /// Hand a datagram's buffer back so the endpoint may receive
    /// again.
    fn udp_return_buffer_async(
        &mut self,
        endpoint: EndpointId,
        token: DatagramToken,
    ) -> NetResult<UdpHandle>;

    /// Borrow the bytes behind a datagram token.
    fn datagram_bytes<'a>(&'a self, token: &DatagramToken) -> &'a [u8];

    fn udp_check_send(&mut self, handle: UdpHandle) -> AsyncPoll<()>;

    fn udp_check_receive(&mut self, handle: UdpHandle) -> AsyncPoll<UdpRecvInfo>;

    fn udp_check_return(&mut self, handle: UdpHandle) -> AsyncPoll<()>;

    fn udp_cancel_async(&mut self, handle: UdpHandle);
}

// ── Address utilities ────────────────────────────────────────

/// Format an address as a dotted quad into fixed storage.
pub fn format_ipv4(ip: Ipv4Addr) -> heapless::String<15> {
    use core::fmt::Write;
    let mut s = heapless::String::new();
    // 15 bytes always fits "255.255.255.255".
    let _ = write!(s, "{ip}");
    s
}

/// Strict dotted-quad parser: exactly four decimal octets 0-255, no
/// leading '+', no empty parts.
pub fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut n = 0;
    for part in s.split('.') {
        if n == 4 || part.is_empty() || part.len() > 3 {
            return None;
        }
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let v: u32 = part.parse().ok()?;
        if v > 255 {
            return None;
        }
        octets[n] = v as u8;
        n += 1;
    }
    if n != 4 {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

// ── Tests ────────────────────────────────────────────────────
