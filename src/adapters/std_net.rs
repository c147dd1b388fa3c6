//! Standard-host network driver.
//!
//! Implements the [`Driver`] operations table over non-blocking
//! `std::net` sockets, with `socket2` filling the gaps std cannot
//! express: SO_REUSEADDR and SO_BROADCAST on the discovery socket,
//! and raw in-progress `connect()` for polled async connects.
//!
//! ## Async model
//!
//! Socket progress is made inside the `check_*` polls (the "status
//! word" reads) and in [`pump`](StdNetDriver::pump), which also
//! plays the role of the driver's event context: it detects refused
//! connects and remote closes and posts the corresponding events
//! into the [`AsrRouter`]. Events are posted at most once per
//! connection; handle completion still flows through the polls.
//!
//! ## Buffers
//!
//! Every stream and endpoint allocates its receive buffer once at
//! create time and never reallocates it, so the address handed out
//! through tokens stays stable until the matching return call.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};

use log::{debug, info};
use socket2::{Domain, Socket, Type};

use crate::net::asr::{AsrCode, AsrEvent, AsrRouter, StreamKey, TerminateReason};
use crate::net::driver::{
    AsyncPoll, ConnState, DatagramToken, Driver, EndpointId, HandleUsage, MAX_TCP_STREAMS,
    MAX_UDP_ENDPOINTS, NetError, NetResult, RdsBatch, StreamId, TcpCompletion, TcpHandle,
    TcpStatus, UdpHandle, UdpRecvInfo,
};
use crate::net::handles::{TcpOpKind, TcpOpPool, UdpOpKind, UdpOpPool};

// ── Slot state ───────────────────────────────────────────────

/// Where the endpoint's receive buffer currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufState {
    /// Driver-owned; a receive may fill it.
    Idle,
    /// Handed to the application as a token.
    Held,
    /// Return started; completes on the next check.
    Returning,
}

struct EndpointSlot {
    socket: UdpSocket,
    rcv_buf: Vec<u8>,
    rcv_len: usize,
    buf_state: BufState,
}

struct StreamSlot {
    listener: Option<TcpListener>,
    /// In-progress non-blocking connect.
    connecting: Option<Socket>,
    conn: Option<TcpStream>,
    /// Connect failure observed by pump, consumed by the poll.
    connect_error: Option<NetError>,
    rcv_buf: Vec<u8>,
    rcv_len: usize,
    batch_held: bool,
    remote: Option<(Ipv4Addr, u16)>,
    state: ConnState,
    fin_seen: bool,
    /// One terminate/closing event per connection.
    event_posted: bool,
}

impl StreamSlot {
    fn new(buffer_size: usize) -> Self {
        Self {
            listener: None,
            connecting: None,
            conn: None,
            connect_error: None,
            rcv_buf: vec![0; buffer_size],
            rcv_len: 0,
            batch_held: false,
            remote: None,
            state: ConnState::Closed,
            fin_seen: false,
            event_posted: false,
        }
    }
}

// ── Driver ───────────────────────────────────────────────────

pub struct StdNetDriver {
    local_ip: Ipv4Addr,
    tcp_ops: TcpOpPool,
    udp_ops: UdpOpPool,
    streams: [Option<StreamSlot>; MAX_TCP_STREAMS],
    endpoints: [Option<EndpointSlot>; MAX_UDP_ENDPOINTS],
}

impl StdNetDriver {
    /// Open the driver and pick the local address.
    pub fn new() -> Self {
        let local_ip = detect_local_ip();
        info!(target: "net", "std-net driver up, local address {local_ip}");
        Self {
            local_ip,
            tcp_ops: TcpOpPool::new(),
            udp_ops: UdpOpPool::new(),
            streams: [const { None }; MAX_TCP_STREAMS],
            endpoints: [const { None }; MAX_UDP_ENDPOINTS],
        }
    }

    fn stream(&self, stream: StreamId) -> NetResult<&StreamSlot> {
        self.streams
            .get(stream.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(NetError::InvalidParam)
    }

    fn stream_mut(&mut self, stream: StreamId) -> NetResult<&mut StreamSlot> {
        self.streams
            .get_mut(stream.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(NetError::InvalidParam)
    }

    fn endpoint_mut(&mut self, endpoint: EndpointId) -> NetResult<&mut EndpointSlot> {
        self.endpoints
            .get_mut(endpoint.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(NetError::InvalidParam)
    }
}

impl Default for StdNetDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for StdNetDriver {
    // ── Lifecycle / utility ──────────────────────────────────

    fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn pump(&mut self, router: &AsrRouter) {
        for (i, slot) in self.streams.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            let key = StreamKey::Tcp(StreamId(i as u8));

            // Refused / failed connects surface here first, as an
            // event; the poll later frees the handle.
            if let Some(sock) = slot.connecting.as_ref() {
                if let Ok(Some(err)) = sock.take_error() {
                    debug!(target: "net", "stream {i}: connect error: {err}");
                    slot.connecting = None;
                    slot.connect_error = Some(NetError::ConnectionFailed);
                    slot.state = ConnState::Closed;
                    if !slot.event_posted {
                        slot.event_posted = true;
                        router.post(key, AsrEvent::terminate(TerminateReason::RemoteClose));
                    }
                }
            }

            // Remote FIN / RST detection on live connections.
            if slot.fin_seen || slot.event_posted {
                continue;
            }
            let Some(conn) = slot.conn.as_ref() else {
                continue;
            };
            if !slot.state.reached_established() {
                continue;
            }
            let mut probe = [0u8; 1];
            match conn.peek(&mut probe) {
                Ok(0) => {
                    slot.fin_seen = true;
                    slot.state = ConnState::CloseWait;
                    slot.event_posted = true;
                    let ev = if slot.listener.is_some() {
                        AsrEvent::simple(AsrCode::Closing)
                    } else {
                        AsrEvent::terminate(TerminateReason::RemoteClose)
                    };
                    router.post(key, ev);
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    slot.state = ConnState::Closed;
                    slot.event_posted = true;
                    router.post(key, AsrEvent::terminate(TerminateReason::RemoteClose));
                }
            }
        }
    }

    fn resolve(&mut self, hostname: &str) -> NetResult<Ipv4Addr> {
        let addrs = (hostname, 0u16)
            .to_socket_addrs()
            .map_err(|_| NetError::Unknown)?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return Ok(*v4.ip());
            }
        }
        Err(NetError::Unknown)
    }

    fn implementation_name(&self) -> &'static str {
        "std-net"
    }

    fn shutdown(&mut self) {
        self.streams = [const { None }; MAX_TCP_STREAMS];
        self.endpoints = [const { None }; MAX_UDP_ENDPOINTS];
        self.tcp_ops = TcpOpPool::new();
        self.udp_ops = UdpOpPool::new();
        info!(target: "net", "std-net driver shut down");
    }

    fn handles_outstanding(&self) -> HandleUsage {
        HandleUsage {
            udp_in_use: self.udp_ops.in_use_count(),
            tcp_in_use: self.tcp_ops.in_use_count(),
        }
    }

    // ── TCP ──────────────────────────────────────────────────

    fn tcp_create(&mut self) -> NetResult<StreamId> {
        for (i, slot) in self.streams.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(StreamSlot::new(crate::protocol::BUFFER_SIZE));
                return Ok(StreamId(i as u8));
            }
        }
        Err(NetError::OutOfMemory)
    }

    fn tcp_release(&mut self, stream: StreamId) -> NetResult<()> {
        let slot = self
            .streams
            .get_mut(stream.0 as usize)
            .ok_or(NetError::InvalidParam)?;
        if slot.is_none() {
            return Err(NetError::InvalidParam);
        }
        *slot = None;
        Ok(())
    }

    fn tcp_listen_async(&mut self, stream: StreamId, port: u16) -> NetResult<TcpHandle> {
        let slot = self.stream_mut(stream)?;
        if slot.listener.is_none() {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
                .map_err(map_io_error)?;
            listener.set_nonblocking(true).map_err(map_io_error)?;
            slot.listener = Some(listener);
        }
        slot.state = ConnState::Listening;
        self.tcp_ops.alloc(TcpOpKind::Listen, stream)
    }

    fn tcp_connect_async(
        &mut self,
        stream: StreamId,
        ip: Ipv4Addr,
        port: u16,
    ) -> NetResult<TcpHandle> {
        let slot = self.stream_mut(stream)?;
        if slot.conn.is_some() || slot.connecting.is_some() {
            return Err(NetError::Busy);
        }

        let sock = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(map_io_error)?;
        sock.set_nonblocking(true).map_err(map_io_error)?;
        let addr = SocketAddr::from((ip, port));
        match sock.connect(&addr.into()) {
            Ok(()) => {
                // Connected synchronously (loopback does this).
                slot.conn = Some(sock.into());
                slot.state = ConnState::Established;
            }
            Err(e)
                if e.raw_os_error() == Some(115) // EINPROGRESS
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                slot.connecting = Some(sock);
                slot.state = ConnState::SynSent;
            }
            Err(e) => return Err(map_io_error(e)),
        }
        slot.remote = Some((ip, port));
        slot.connect_error = None;
        slot.fin_seen = false;
        slot.event_posted = false;
        self.tcp_ops.alloc(TcpOpKind::Connect, stream)
    }

    fn tcp_send_async(&mut self, stream: StreamId, data: &[u8], push: bool) -> NetResult<TcpHandle> {
        if self.stream(stream)?.conn.is_none() {
            return Err(NetError::ConnectionClosed);
        }
        let handle = self.tcp_ops.alloc(TcpOpKind::Send, stream)?;
        let op = self.tcp_ops.get_mut(handle)?;
        op.push = push;
        op.payload.clear();
        if op.payload.extend_from_slice(data).is_err() {
            self.tcp_ops.free(handle);
            return Err(NetError::InvalidParam);
        }
        Ok(handle)
    }

    fn tcp_receive_no_copy(
        &mut self,
        stream: StreamId,
        max_entries: usize,
    ) -> NetResult<Option<RdsBatch>> {
        debug_assert!(max_entries > 0);
        let slot = self.stream_mut(stream)?;
        if slot.batch_held {
            return Err(NetError::Busy);
        }

        if let Some(conn) = slot.conn.as_mut() {
            loop {
                if slot.rcv_len == slot.rcv_buf.len() {
                    break;
                }
                match conn.read(&mut slot.rcv_buf[slot.rcv_len..]) {
                    Ok(0) => {
                        slot.fin_seen = true;
                        slot.state = ConnState::CloseWait;
                        break;
                    }
                    Ok(n) => slot.rcv_len += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
        }

        if slot.rcv_len == 0 {
            return Ok(None);
        }
        slot.batch_held = true;
        Ok(Some(RdsBatch::new(stream, slot.rcv_len, 1, false, true)))
    }

    fn rds_bytes<'a>(&'a self, batch: &RdsBatch) -> &'a [u8] {
        match self.stream(batch.stream()) {
            Ok(slot) => &slot.rcv_buf[..batch.len().min(slot.rcv_buf.len())],
            Err(_) => &[],
        }
    }

    fn tcp_return_buffer(&mut self, stream: StreamId, batch: RdsBatch) -> NetResult<()> {
        if batch.stream() != stream {
            return Err(NetError::InvalidParam);
        }
        let slot = self.stream_mut(stream)?;
        slot.batch_held = false;
        slot.rcv_len = 0;
        Ok(())
    }

    fn tcp_close_async(&mut self, stream: StreamId) -> NetResult<TcpHandle> {
        let slot = self.stream_mut(stream)?;
        let Some(conn) = slot.conn.as_ref() else {
            return Err(NetError::ConnectionClosed);
        };
        conn.shutdown(std::net::Shutdown::Write)
            .map_err(map_io_error)?;
        slot.state = ConnState::FinWait;
        self.tcp_ops.alloc(TcpOpKind::Close, stream)
    }

    fn tcp_abort(&mut self, stream: StreamId) {
        if let Ok(slot) = self.stream_mut(stream) {
            // The receive buffer (and any held batch) survives the
            // abort: the listen slot processes records after
            // releasing the connection.
            slot.conn = None;
            slot.connecting = None;
            slot.connect_error = None;
            slot.remote = None;
            slot.fin_seen = false;
            slot.event_posted = false;
            slot.state = if slot.listener.is_some() {
                ConnState::Listening
            } else {
                ConnState::Closed
            };
        }
    }

    fn tcp_status(&self, stream: StreamId) -> NetResult<TcpStatus> {
        let slot = self.stream(stream)?;
        let (remote_ip, remote_port) = slot.remote.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
        let local_port = slot
            .listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .or_else(|| slot.conn.as_ref().and_then(|c| c.local_addr().ok()))
            .map_or(0, |a| a.port());
        Ok(TcpStatus {
            local_ip: self.local_ip,
            local_port,
            remote_ip,
            remote_port,
            state: slot.state,
            is_connected: slot.conn.is_some() && slot.state.reached_established(),
            is_listening: slot.listener.is_some(),
        })
    }

    fn tcp_check_async(&mut self, handle: TcpHandle) -> AsyncPoll<TcpCompletion> {
        let (kind, stream) = match self.tcp_ops.get(handle) {
            Ok(op) => (op.kind, op.stream),
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        match kind {
            TcpOpKind::Listen => self.check_listen(handle, stream),
            TcpOpKind::Connect => self.check_connect(handle, stream),
            TcpOpKind::Send => self.check_send(handle, stream),
            TcpOpKind::Close => self.check_close(handle, stream),
            TcpOpKind::Receive => {
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Err(NetError::NotSupported))
            }
        }
    }

    fn tcp_cancel_async(&mut self, handle: TcpHandle) {
        // The socket operation, if any, dies with the stream state;
        // only the descriptor needs reclaiming.
        self.tcp_ops.free(handle);
    }

    // ── UDP ──────────────────────────────────────────────────

    fn udp_create(&mut self, port: u16, buffer_size: usize) -> NetResult<EndpointId> {
        let idx = self
            .endpoints
            .iter()
            .position(Option::is_none)
            .ok_or(NetError::OutOfMemory)?;

        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(map_io_error)?;
        sock.set_reuse_address(true).map_err(map_io_error)?;
        sock.set_broadcast(true).map_err(map_io_error)?;
        sock.set_nonblocking(true).map_err(map_io_error)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        sock.bind(&addr.into()).map_err(map_io_error)?;

        self.endpoints[idx] = Some(EndpointSlot {
            socket: sock.into(),
            rcv_buf: vec![0; buffer_size],
            rcv_len: 0,
            buf_state: BufState::Idle,
        });
        debug!(target: "net", "udp endpoint {idx} bound to port {port}");
        Ok(EndpointId(idx as u8))
    }

    fn udp_release(&mut self, endpoint: EndpointId) -> NetResult<()> {
        let slot = self
            .endpoints
            .get_mut(endpoint.0 as usize)
            .ok_or(NetError::InvalidParam)?;
        if slot.is_none() {
            return Err(NetError::InvalidParam);
        }
        *slot = None;
        Ok(())
    }

    fn udp_send_async(
        &mut self,
        endpoint: EndpointId,
        ip: Ipv4Addr,
        port: u16,
        payload: &[u8],
    ) -> NetResult<UdpHandle> {
        self.endpoint_mut(endpoint)?;
        let handle = self.udp_ops.alloc(UdpOpKind::Send, endpoint)?;
        let op = self.udp_ops.get_mut(handle)?;
        op.dest_ip = ip;
        op.dest_port = port;
        op.payload.clear();
        if op.payload.extend_from_slice(payload).is_err() {
            self.udp_ops.free(handle);
            return Err(NetError::InvalidParam);
        }
        Ok(handle)
    }

    fn udp_receive_async(&mut self, endpoint: EndpointId) -> NetResult<UdpHandle> {
        let slot = self.endpoint_mut(endpoint)?;
        if slot.buf_state != BufState::Idle {
            return Err(NetError::Busy);
        }
        self.udp_ops.alloc(UdpOpKind::Receive, endpoint)
    }

    fn udp_return_buffer_async(
        &mut self,
        endpoint: EndpointId,
        token: DatagramToken,
    ) -> NetResult<UdpHandle> {
        if token.endpoint() != endpoint {
            return Err(NetError::InvalidParam);
        }
        let slot = self.endpoint_mut(endpoint)?;
        if slot.buf_state != BufState::Held {
            return Err(NetError::InvalidParam);
        }
        slot.buf_state = BufState::Returning;
        self.udp_ops.alloc(UdpOpKind::BufferReturn, endpoint)
    }

    fn datagram_bytes<'a>(&'a self, token: &DatagramToken) -> &'a [u8] {
        match self
            .endpoints
            .get(token.endpoint().0 as usize)
            .and_then(Option::as_ref)
        {
            Some(slot) => &slot.rcv_buf[..token.len().min(slot.rcv_buf.len())],
            None => &[],
        }
    }

    fn udp_check_send(&mut self, handle: UdpHandle) -> AsyncPoll<()> {
        let endpoint = match self.udp_ops.get(handle) {
            Ok(op) => op.endpoint,
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        let Some(slot) = self
            .endpoints
            .get(endpoint.0 as usize)
            .and_then(Option::as_ref)
        else {
            self.udp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };

        let op = match self.udp_ops.get(handle) {
            Ok(op) => op,
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        let dest = SocketAddr::from((op.dest_ip, op.dest_port));
        match slot.socket.send_to(&op.payload, dest) {
            Ok(_) => {
                self.udp_ops.free(handle);
                AsyncPoll::Complete(Ok(()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => AsyncPoll::Pending,
            Err(e) => {
                self.udp_ops.free(handle);
                AsyncPoll::Complete(Err(map_io_error(e)))
            }
        }
    }

    fn udp_check_receive(&mut self, handle: UdpHandle) -> AsyncPoll<UdpRecvInfo> {
        let endpoint = match self.udp_ops.get(handle) {
            Ok(op) => op.endpoint,
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        let Some(slot) = self
            .endpoints
            .get_mut(endpoint.0 as usize)
            .and_then(Option::as_mut)
        else {
            self.udp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };
        if slot.buf_state != BufState::Idle {
            self.udp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::Busy));
        }

        match slot.socket.recv_from(&mut slot.rcv_buf) {
            Ok((n, SocketAddr::V4(from))) => {
                slot.rcv_len = n;
                slot.buf_state = BufState::Held;
                self.udp_ops.free(handle);
                AsyncPoll::Complete(Ok(UdpRecvInfo {
                    remote_ip: *from.ip(),
                    remote_port: from.port(),
                    token: DatagramToken::new(endpoint, n),
                }))
            }
            Ok((_, SocketAddr::V6(_))) => AsyncPoll::Pending,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => AsyncPoll::Pending,
            Err(e) => {
                self.udp_ops.free(handle);
                AsyncPoll::Complete(Err(map_io_error(e)))
            }
        }
    }

    fn udp_check_return(&mut self, handle: UdpHandle) -> AsyncPoll<()> {
        let endpoint = match self.udp_ops.get(handle) {
            Ok(op) => op.endpoint,
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        let result = match self
            .endpoints
            .get_mut(endpoint.0 as usize)
            .and_then(Option::as_mut)
        {
            Some(slot) => {
                slot.buf_state = BufState::Idle;
                slot.rcv_len = 0;
                Ok(())
            }
            None => Err(NetError::InvalidParam),
        };
        self.udp_ops.free(handle);
        AsyncPoll::Complete(result)
    }

    fn udp_cancel_async(&mut self, handle: UdpHandle) {
        if let Ok(op) = self.udp_ops.get(handle) {
            // A cancelled buffer return still completes logically:
            // the buffer goes back to the driver.
            if op.kind == UdpOpKind::BufferReturn {
                if let Some(slot) = self
                    .endpoints
                    .get_mut(op.endpoint.0 as usize)
                    .and_then(Option::as_mut)
                {
                    slot.buf_state = BufState::Idle;
                    slot.rcv_len = 0;
                }
            }
        }
        self.udp_ops.free(handle);
    }
}

// ── TCP poll bodies ──────────────────────────────────────────

impl StdNetDriver {
    fn check_listen(&mut self, handle: TcpHandle, stream: StreamId) -> AsyncPoll<TcpCompletion> {
        // Field projection keeps the stream and descriptor borrows
        // disjoint.
        let slot = match self
            .streams
            .get_mut(stream.0 as usize)
            .and_then(Option::as_mut)
        {
            Some(slot) => slot,
            None => {
                self.tcp_ops.free(handle);
                return AsyncPoll::Complete(Err(NetError::InvalidParam));
            }
        };
        let Some(listener) = slot.listener.as_ref() else {
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::NotInitialized));
        };

        match listener.accept() {
            Ok((conn, SocketAddr::V4(from))) => {
                if conn.set_nonblocking(true).is_err() {
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Err(NetError::Unknown));
                }
                let (remote_ip, remote_port) = (*from.ip(), from.port());
                slot.conn = Some(conn);
                slot.remote = Some((remote_ip, remote_port));
                slot.state = ConnState::Established;
                slot.fin_seen = false;
                slot.event_posted = false;
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Ok(TcpCompletion::Listen {
                    remote_ip,
                    remote_port,
                }))
            }
            Ok((_, SocketAddr::V6(_))) => AsyncPoll::Pending,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => AsyncPoll::Pending,
            Err(e) => {
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Err(map_io_error(e)))
            }
        }
    }

    fn check_connect(&mut self, handle: TcpHandle, stream: StreamId) -> AsyncPoll<TcpCompletion> {
        let slot = match self
            .streams
            .get_mut(stream.0 as usize)
            .and_then(Option::as_mut)
        {
            Some(slot) => slot,
            None => {
                self.tcp_ops.free(handle);
                return AsyncPoll::Complete(Err(NetError::InvalidParam));
            }
        };

        if let Some(e) = slot.connect_error.take() {
            slot.connecting = None;
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Err(e));
        }
        if slot.conn.is_some() {
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Ok(TcpCompletion::Connect));
        }

        let Some(sock) = slot.connecting.as_ref() else {
            // Aborted underneath us (timeout sweep).
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::ConnectionFailed));
        };

        match sock.take_error() {
            Ok(Some(_)) => {
                slot.connecting = None;
                slot.state = ConnState::Closed;
                self.tcp_ops.free(handle);
                return AsyncPoll::Complete(Err(NetError::ConnectionFailed));
            }
            Ok(None) => {}
            Err(_) => {
                slot.connecting = None;
                slot.state = ConnState::Closed;
                self.tcp_ops.free(handle);
                return AsyncPoll::Complete(Err(NetError::Unknown));
            }
        }

        // peer_addr succeeds once the handshake finishes.
        if sock.peer_addr().is_ok() {
            if let Some(sock) = slot.connecting.take() {
                slot.conn = Some(sock.into());
                slot.state = ConnState::Established;
            }
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Ok(TcpCompletion::Connect));
        }
        AsyncPoll::Pending
    }

    fn check_send(&mut self, handle: TcpHandle, stream: StreamId) -> AsyncPoll<TcpCompletion> {
        // Split borrows: descriptor payload and stream socket are
        // distinct fields.
        let Some(slot) = self
            .streams
            .get_mut(stream.0 as usize)
            .and_then(Option::as_mut)
        else {
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };
        let Some(conn) = slot.conn.as_mut() else {
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::ConnectionClosed));
        };
        let Ok(op) = self.tcp_ops.get_mut(handle) else {
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };

        while !op.payload.is_empty() {
            match conn.write(&op.payload) {
                Ok(0) => {
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Err(NetError::ConnectionClosed));
                }
                Ok(n) => {
                    let rest: heapless::Vec<u8, { crate::protocol::BUFFER_SIZE }> =
                        heapless::Vec::from_slice(&op.payload[n..]).unwrap_or_default();
                    op.payload = rest;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return AsyncPoll::Pending,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Err(map_io_error(e)));
                }
            }
        }

        if op.push {
            let _ = conn.flush();
        }
        self.tcp_ops.free(handle);
        AsyncPoll::Complete(Ok(TcpCompletion::Send))
    }

    fn check_close(&mut self, handle: TcpHandle, stream: StreamId) -> AsyncPoll<TcpCompletion> {
        // shutdown(Write) already went out with close_async; the
        // half-closed socket needs no further driving, so the close
        // completes on its first poll.
        if let Some(slot) = self
            .streams
            .get_mut(stream.0 as usize)
            .and_then(Option::as_mut)
        {
            slot.state = if slot.fin_seen {
                ConnState::Closed
            } else {
                ConnState::FinWait
            };
        }
        self.tcp_ops.free(handle);
        AsyncPoll::Complete(Ok(TcpCompletion::Close))
    }
}

// ── Helpers ──────────────────────────────────────────────────

fn map_io_error(e: std::io::Error) -> NetError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused => NetError::ConnectionFailed,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => NetError::ConnectionClosed,
        ErrorKind::AddrInUse | ErrorKind::WouldBlock => NetError::Busy,
        ErrorKind::TimedOut => NetError::Timeout,
        ErrorKind::InvalidInput => NetError::InvalidParam,
        ErrorKind::OutOfMemory => NetError::OutOfMemory,
        _ => NetError::Unknown,
    }
}

/// Pick the outbound interface address: a connected (never sent-on)
/// UDP socket reveals which source address the host would route
/// through. Falls back to loopback when there is no route.
fn detect_local_ip() -> Ipv4Addr {
    let fallback = Ipv4Addr::LOCALHOST;
    let Ok(sock) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) else {
        return fallback;
    };
    if sock.connect((Ipv4Addr::new(8, 8, 8, 8), 53)).is_err() {
        return fallback;
    }
    match sock.local_addr() {
        Ok(SocketAddr::V4(a)) => *a.ip(),
        _ => fallback,
    }
}

// ── Tests ────────────────────────────────────────────────────
