//! Scriptable in-memory network driver.
//!
//! Implements the full [`Driver`] operations table with no sockets:
//! tests script inbound traffic (`deliver_udp`, `push_accept`),
//! connection outcomes (`auto_connect`, `refuse_next_connect`,
//! `close_after_send`), and completion stalls (`stall_returns`,
//! `stall_sends`), and read back what the engines did through the
//! captured sends and the chronological call log.
//!
//! Events flow the same way they do in the real driver: `pump` is
//! the event context and posts into the router; the polls observe
//! results and free handles.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;

use lanmsg::net::asr::{AsrEvent, AsrRouter, StreamKey, TerminateReason};
use lanmsg::net::driver::{
    AsyncPoll, ConnState, DatagramToken, Driver, EndpointId, HandleUsage, MAX_TCP_STREAMS,
    MAX_UDP_ENDPOINTS, NetError, NetResult, RdsBatch, StreamId, TcpCompletion, TcpHandle,
    TcpStatus, UdpHandle, UdpRecvInfo,
};
use lanmsg::net::handles::{TcpOpKind, TcpOpPool, UdpOpKind, UdpOpPool};

// ── Scripted state ───────────────────────────────────────────

struct MockEndpoint {
    port: u16,
    inbox: VecDeque<(Ipv4Addr, u16, Vec<u8>)>,
    rcv_data: Vec<u8>,
    buf_held: bool,
    buf_returning: bool,
}

impl MockEndpoint {
    fn new(port: u16) -> Self {
        Self {
            port,
            inbox: VecDeque::new(),
            rcv_data: Vec::new(),
            buf_held: false,
            buf_returning: false,
        }
    }
}

struct MockStream {
    listening: bool,
    accept_queue: VecDeque<(Ipv4Addr, u16, Vec<u8>)>,
    rcv_data: Vec<u8>,
    batch_held: bool,
    connected: bool,
    connecting: bool,
    connect_target: Option<(Ipv4Addr, u16)>,
    /// Error the next connect poll reports (set by refusal).
    connect_error: Option<NetError>,
    /// Post a refusal event on the next pump.
    refuse_pending: bool,
    /// Post a remote-close event after the send completes.
    close_after_send: bool,
    close_event_due: bool,
    state: ConnState,
    remote: Option<(Ipv4Addr, u16)>,
}

impl MockStream {
    fn new() -> Self {
        Self {
            listening: false,
            accept_queue: VecDeque::new(),
            rcv_data: Vec::new(),
            batch_held: false,
            connected: false,
            connecting: false,
            connect_target: None,
            connect_error: None,
            refuse_pending: false,
            close_after_send: false,
            close_event_due: false,
            state: ConnState::Closed,
            remote: None,
        }
    }
}

/// One captured outbound TCP record.
#[derive(Debug, Clone)]
pub struct CapturedSend {
    pub dest: Ipv4Addr,
    pub port: u16,
    pub bytes: Vec<u8>,
}

pub struct MockDriver {
    pub local_ip: Ipv4Addr,
    tcp_ops: TcpOpPool,
    udp_ops: UdpOpPool,
    streams: Vec<Option<MockStream>>,
    endpoints: Vec<Option<MockEndpoint>>,

    // Scripting knobs.
    /// Connects complete successfully on their first poll.
    pub auto_connect: bool,
    /// Remaining buffer-return polls to leave pending.
    pub stall_returns: u32,
    /// Remaining UDP-send polls to leave pending.
    pub stall_sends: u32,

    // Capture.
    pub udp_sent: Vec<CapturedSend>,
    pub tcp_sent: Vec<CapturedSend>,
    calls: RefCell<Vec<String>>,
}

impl MockDriver {
    pub fn new(local_ip: Ipv4Addr) -> Self {
        Self {
            local_ip,
            tcp_ops: TcpOpPool::new(),
            udp_ops: UdpOpPool::new(),
            streams: (0..MAX_TCP_STREAMS).map(|_| None).collect(),
            endpoints: (0..MAX_UDP_ENDPOINTS).map(|_| None).collect(),
            auto_connect: true,
            stall_returns: 0,
            stall_sends: 0,
            udp_sent: Vec::new(),
            tcp_sent: Vec::new(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn log(&self, entry: String) {
        self.calls.borrow_mut().push(entry);
    }

    /// Chronological driver call log.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn clear_log(&mut self) {
        self.calls.borrow_mut().clear();
    }

    /// Index of the first log entry equal to `needle`, if any.
    pub fn log_index(&self, needle: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|e| e == needle)
    }

    // ── Test scripting ───────────────────────────────────────

    /// Queue an inbound datagram for the endpoint on `port`.
    pub fn deliver_udp(&mut self, port: u16, from: Ipv4Addr, from_port: u16, bytes: &[u8]) {
        let ep = self
            .endpoints
            .iter_mut()
            .flatten()
            .find(|e| e.port == port)
            .expect("no endpoint on that port");
        ep.inbox.push_back((from, from_port, bytes.to_vec()));
    }

    /// Queue an inbound connection (with its one record) for the
    /// listening stream. The engines keep exactly one listen slot,
    /// so "the listening stream" is unambiguous.
    pub fn push_accept(&mut self, from: Ipv4Addr, from_port: u16, record: &[u8]) {
        let slot = self
            .streams
            .iter_mut()
            .flatten()
            .find(|s| s.listening)
            .expect("no listening stream");
        slot.accept_queue.push_back((from, from_port, record.to_vec()));
    }

    /// The next connect on `stream` is refused: pump posts the
    /// terminate event, the poll then reports the failure.
    pub fn refuse_next_connect(&mut self, stream: StreamId) {
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .expect("no such stream");
        slot.refuse_pending = true;
        slot.connect_error = Some(NetError::ConnectionFailed);
    }

    /// After the next send on `stream` completes, the remote closes
    /// (the stateless protocol's normal ending).
    pub fn set_close_after_send(&mut self, stream: StreamId) {
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .expect("no such stream");
        slot.close_after_send = true;
    }

    /// Stream ids currently holding an outbound connection attempt
    /// to `dest`.
    pub fn streams_connected_to(&self, dest: Ipv4Addr) -> Vec<StreamId> {
        self.streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let s = s.as_ref()?;
                (s.connect_target.map(|(ip, _)| ip) == Some(dest)).then_some(StreamId(i as u8))
            })
            .collect()
    }
}

// ── Driver implementation ────────────────────────────────────

impl Driver for MockDriver {
    fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    fn pump(&mut self, router: &AsrRouter) {
        for (i, slot) in self.streams.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            let key = StreamKey::Tcp(StreamId(i as u8));
            if slot.refuse_pending {
                slot.refuse_pending = false;
                slot.connecting = false;
                slot.state = ConnState::Closed;
                router.post(key, AsrEvent::terminate(TerminateReason::RemoteClose));
            }
            if slot.close_event_due {
                slot.close_event_due = false;
                slot.state = ConnState::CloseWait;
                router.post(key, AsrEvent::terminate(TerminateReason::RemoteClose));
            }
        }
    }

    fn resolve(&mut self, _hostname: &str) -> NetResult<Ipv4Addr> {
        Ok(self.local_ip)
    }

    fn implementation_name(&self) -> &'static str {
        "mock"
    }

    fn shutdown(&mut self) {
        self.log("shutdown".to_string());
        self.streams.iter_mut().for_each(|s| *s = None);
        self.endpoints.iter_mut().for_each(|e| *e = None);
    }

    fn handles_outstanding(&self) -> HandleUsage {
        HandleUsage {
            udp_in_use: self.udp_ops.in_use_count(),
            tcp_in_use: self.tcp_ops.in_use_count(),
        }
    }

    // ── TCP ──────────────────────────────────────────────────

    fn tcp_create(&mut self) -> NetResult<StreamId> {
        let idx = self
            .streams
            .iter()
            .position(Option::is_none)
            .ok_or(NetError::OutOfMemory)?;
        self.streams[idx] = Some(MockStream::new());
        Ok(StreamId(idx as u8))
    }

    fn tcp_release(&mut self, stream: StreamId) -> NetResult<()> {
        let slot = self
            .streams
            .get_mut(stream.0 as usize)
            .ok_or(NetError::InvalidParam)?;
        if slot.take().is_none() {
            return Err(NetError::InvalidParam);
        }
        Ok(())
    }

    fn tcp_listen_async(&mut self, stream: StreamId, _port: u16) -> NetResult<TcpHandle> {
        self.log(format!("listen_async({})", stream.0));
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .ok_or(NetError::InvalidParam)?;
        slot.listening = true;
        slot.state = ConnState::Listening;
        self.tcp_ops.alloc(TcpOpKind::Listen, stream)
    }

    fn tcp_connect_async(&mut self, stream: StreamId, ip: Ipv4Addr, port: u16) -> NetResult<TcpHandle> {
        self.log(format!("connect_async({},{ip})", stream.0));
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .ok_or(NetError::InvalidParam)?;
        if slot.connected || slot.connecting {
            return Err(NetError::Busy);
        }
        slot.connecting = true;
        slot.connect_target = Some((ip, port));
        slot.state = ConnState::SynSent;
        self.tcp_ops.alloc(TcpOpKind::Connect, stream)
    }

    fn tcp_send_async(&mut self, stream: StreamId, data: &[u8], push: bool) -> NetResult<TcpHandle> {
        self.log(format!("send_async({})", stream.0));
        let slot = self.streams[stream.0 as usize]
            .as_ref()
            .ok_or(NetError::InvalidParam)?;
        if !slot.connected {
            return Err(NetError::ConnectionClosed);
        }
        let handle = self.tcp_ops.alloc(TcpOpKind::Send, stream)?;
        let op = self.tcp_ops.get_mut(handle)?;
        op.push = push;
        op.payload.clear();
        op.payload
            .extend_from_slice(data)
            .map_err(|()| NetError::InvalidParam)?;
        Ok(handle)
    }

    fn tcp_receive_no_copy(&mut self, stream: StreamId, _max: usize) -> NetResult<Option<RdsBatch>> {
        self.log(format!("receive_no_copy({})", stream.0));
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .ok_or(NetError::InvalidParam)?;
        if slot.batch_held {
            return Err(NetError::Busy);
        }
        if slot.rcv_data.is_empty() {
            return Ok(None);
        }
        slot.batch_held = true;
        Ok(Some(RdsBatch::new(stream, slot.rcv_data.len(), 1, false, true)))
    }

    fn rds_bytes<'a>(&'a self, batch: &RdsBatch) -> &'a [u8] {
        self.log(format!("rds_bytes({})", batch.stream().0));
        match self.streams[batch.stream().0 as usize].as_ref() {
            Some(slot) => &slot.rcv_data[..batch.len().min(slot.rcv_data.len())],
            None => &[],
        }
    }

    fn tcp_return_buffer(&mut self, stream: StreamId, batch: RdsBatch) -> NetResult<()> {
        self.log(format!("return_buffer({})", stream.0));
        if batch.stream() != stream {
            return Err(NetError::InvalidParam);
        }
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .ok_or(NetError::InvalidParam)?;
        slot.batch_held = false;
        slot.rcv_data.clear();
        Ok(())
    }

    fn tcp_close_async(&mut self, stream: StreamId) -> NetResult<TcpHandle> {
        self.log(format!("close_async({})", stream.0));
        let slot = self.streams[stream.0 as usize]
            .as_mut()
            .ok_or(NetError::InvalidParam)?;
        if !slot.connected {
            return Err(NetError::ConnectionClosed);
        }
        slot.state = ConnState::FinWait;
        self.tcp_ops.alloc(TcpOpKind::Close, stream)
    }

    fn tcp_abort(&mut self, stream: StreamId) {
        self.log(format!("abort({})", stream.0));
        if let Some(slot) = self.streams[stream.0 as usize].as_mut() {
            slot.connected = false;
            slot.connecting = false;
            slot.connect_error = None;
            slot.refuse_pending = false;
            slot.close_after_send = false;
            slot.close_event_due = false;
            slot.remote = None;
            // rcv_data and batch_held survive: the listen slot
            // processes records after aborting the connection.
            slot.state = if slot.listening {
                ConnState::Listening
            } else {
                ConnState::Closed
            };
        }
    }

    fn tcp_status(&self, stream: StreamId) -> NetResult<TcpStatus> {
        let slot = self.streams[stream.0 as usize]
            .as_ref()
            .ok_or(NetError::InvalidParam)?;
        let (remote_ip, remote_port) = slot.remote.or(slot.connect_target).unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
        Ok(TcpStatus {
            local_ip: self.local_ip,
            local_port: 0,
            remote_ip,
            remote_port,
            state: slot.state,
            is_connected: slot.connected,
            is_listening: slot.listening,
        })
    }

    fn tcp_check_async(&mut self, handle: TcpHandle) -> AsyncPoll<TcpCompletion> {
        let (kind, stream) = match self.tcp_ops.get(handle) {
            Ok(op) => (op.kind, op.stream),
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        let Some(slot) = self.streams[stream.0 as usize].as_mut() else {
            self.tcp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };

        match kind {
            TcpOpKind::Listen => {
                let Some((ip, port, record)) = slot.accept_queue.pop_front() else {
                    return AsyncPoll::Pending;
                };
                slot.connected = true;
                slot.remote = Some((ip, port));
                slot.state = ConnState::Established;
                slot.rcv_data = record;
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Ok(TcpCompletion::Listen {
                    remote_ip: ip,
                    remote_port: port,
                }))
            }
            TcpOpKind::Connect => {
                if let Some(e) = slot.connect_error.take() {
                    slot.connecting = false;
                    slot.state = ConnState::Closed;
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Err(e));
                }
                if slot.connected {
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Ok(TcpCompletion::Connect));
                }
                if !slot.connecting {
                    // Aborted (timeout sweep) under the handle.
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Err(NetError::ConnectionFailed));
                }
                if !self.auto_connect {
                    return AsyncPoll::Pending;
                }
                slot.connecting = false;
                slot.connected = true;
                slot.remote = slot.connect_target;
                slot.state = ConnState::Established;
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Ok(TcpCompletion::Connect))
            }
            TcpOpKind::Send => {
                if !slot.connected {
                    self.tcp_ops.free(handle);
                    return AsyncPoll::Complete(Err(NetError::ConnectionClosed));
                }
                let (dest, port) = slot.remote.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
                if slot.close_after_send {
                    slot.close_after_send = false;
                    slot.close_event_due = true;
                }
                let op = match self.tcp_ops.get(handle) {
                    Ok(op) => op,
                    Err(e) => return AsyncPoll::Complete(Err(e)),
                };
                self.tcp_sent.push(CapturedSend {
                    dest,
                    port,
                    bytes: op.payload.to_vec(),
                });
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Ok(TcpCompletion::Send))
            }
            TcpOpKind::Close => {
                slot.connected = false;
                slot.state = ConnState::Closed;
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Ok(TcpCompletion::Close))
            }
            TcpOpKind::Receive => {
                self.tcp_ops.free(handle);
                AsyncPoll::Complete(Err(NetError::NotSupported))
            }
        }
    }

    fn tcp_cancel_async(&mut self, handle: TcpHandle) {
        self.log(format!("cancel_tcp({})", handle.0));
        self.tcp_ops.free(handle);
    }

    // ── UDP ──────────────────────────────────────────────────

    fn udp_create(&mut self, port: u16, _buffer_size: usize) -> NetResult<EndpointId> {
        let idx = self
            .endpoints
            .iter()
            .position(Option::is_none)
            .ok_or(NetError::OutOfMemory)?;
        self.endpoints[idx] = Some(MockEndpoint::new(port));
        Ok(EndpointId(idx as u8))
    }

    fn udp_release(&mut self, endpoint: EndpointId) -> NetResult<()> {
        let slot = self
            .endpoints
            .get_mut(endpoint.0 as usize)
            .ok_or(NetError::InvalidParam)?;
        if slot.take().is_none() {
            return Err(NetError::InvalidParam);
        }
        Ok(())
    }

    fn udp_send_async(
        &mut self,
        endpoint: EndpointId,
        ip: Ipv4Addr,
        port: u16,
        payload: &[u8],
    ) -> NetResult<UdpHandle> {
        self.log(format!("udp_send_async({ip})"));
        self.endpoints[endpoint.0 as usize]
            .as_ref()
            .ok_or(NetError::InvalidParam)?;
        let handle = self.udp_ops.alloc(UdpOpKind::Send, endpoint)?;
        let op = self.udp_ops.get_mut(handle)?;
        op.dest_ip = ip;
        op.dest_port = port;
        op.payload.clear();
        op.payload
            .extend_from_slice(payload)
            .map_err(|()| NetError::InvalidParam)?;
        Ok(handle)
    }

    fn udp_receive_async(&mut self, endpoint: EndpointId) -> NetResult<UdpHandle> {
        self.log("udp_receive_async".to_string());
        let slot = self.endpoints[endpoint.0 as usize]
            .as_ref()
            .ok_or(NetError::InvalidParam)?;
        if slot.buf_held || slot.buf_returning {
            return Err(NetError::Busy);
        }
        self.udp_ops.alloc(UdpOpKind::Receive, endpoint)
    }

    fn udp_return_buffer_async(
        &mut self,
        endpoint: EndpointId,
        token: DatagramToken,
    ) -> NetResult<UdpHandle> {
        self.log("udp_return_buffer_async".to_string());
        if token.endpoint() != endpoint {
            return Err(NetError::InvalidParam);
        }
        let slot = self.endpoints[endpoint.0 as usize]
            .as_mut()
            .ok_or(NetError::InvalidParam)?;
        if !slot.buf_held {
            return Err(NetError::InvalidParam);
        }
        slot.buf_held = false;
        slot.buf_returning = true;
        self.udp_ops.alloc(UdpOpKind::BufferReturn, endpoint)
    }

    fn datagram_bytes<'a>(&'a self, token: &DatagramToken) -> &'a [u8] {
        match self.endpoints[token.endpoint().0 as usize].as_ref() {
            Some(slot) => &slot.rcv_data[..token.len().min(slot.rcv_data.len())],
            None => &[],
        }
    }

    fn udp_check_send(&mut self, handle: UdpHandle) -> AsyncPoll<()> {
        let Ok(op) = self.udp_ops.get(handle) else {
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };
        if self.stall_sends > 0 {
            self.stall_sends -= 1;
            return AsyncPoll::Pending;
        }
        self.udp_sent.push(CapturedSend {
            dest: op.dest_ip,
            port: op.dest_port,
            bytes: op.payload.to_vec(),
        });
        self.udp_ops.free(handle);
        AsyncPoll::Complete(Ok(()))
    }

    fn udp_check_receive(&mut self, handle: UdpHandle) -> AsyncPoll<UdpRecvInfo> {
        let endpoint = match self.udp_ops.get(handle) {
            Ok(op) => op.endpoint,
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        let Some(slot) = self.endpoints[endpoint.0 as usize].as_mut() else {
            self.udp_ops.free(handle);
            return AsyncPoll::Complete(Err(NetError::InvalidParam));
        };
        let Some((from, from_port, bytes)) = slot.inbox.pop_front() else {
            return AsyncPoll::Pending;
        };
        let len = bytes.len();
        slot.rcv_data = bytes;
        slot.buf_held = true;
        self.udp_ops.free(handle);
        AsyncPoll::Complete(Ok(UdpRecvInfo {
            remote_ip: from,
            remote_port: from_port,
            token: DatagramToken::new(endpoint, len),
        }))
    }

    fn udp_check_return(&mut self, handle: UdpHandle) -> AsyncPoll<()> {
        let endpoint = match self.udp_ops.get(handle) {
            Ok(op) => op.endpoint,
            Err(e) => return AsyncPoll::Complete(Err(e)),
        };
        if self.stall_returns > 0 {
            self.stall_returns -= 1;
            return AsyncPoll::Pending;
        }
        if let Some(slot) = self.endpoints[endpoint.0 as usize].as_mut() {
            slot.buf_returning = false;
            slot.rcv_data.clear();
        }
        self.udp_ops.free(handle);
        AsyncPoll::Complete(Ok(()))
    }

    fn udp_cancel_async(&mut self, handle: UdpHandle) {
        self.log(format!("cancel_udp({})", handle.0));
        if let Ok(op) = self.udp_ops.get(handle) {
            if op.kind == UdpOpKind::BufferReturn {
                if let Some(slot) = self.endpoints[op.endpoint.0 as usize].as_mut() {
                    slot.buf_returning = false;
                    slot.rcv_data.clear();
                }
            }
        }
        self.udp_ops.free(handle);
    }
}
