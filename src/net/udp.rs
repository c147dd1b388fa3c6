//! UDP discovery endpoint.
//!
//! A single endpoint bound to the discovery port drives three
//! overlapped operations, each at most one in flight:
//!
//! ```text
//!        ┌────────────┐   datagram    ┌──────────────────┐
//!   ┌───▶│ ReceiveAsync│──────────────▶│ process_packet   │
//!   │    └────────────┘               └────────┬─────────┘
//!   │                                          │ token
//!   │    ┌──────────────────┐                  ▼
//!   └────│ ReturnBufferAsync│◀──── deferred if return busy
//!        └──────────────────┘
//!        ┌────────────┐
//!        │ SendAsync   │◀── broadcast scheduler / responses / quit
//!        └────────────┘        (FIFO of 8 when the slot is busy)
//! ```
//!
//! The receive buffer belongs to the driver while a receive is in
//! flight; a new receive starts only after the previous datagram's
//! buffer return has completed.

use std::net::Ipv4Addr;

use log::{debug, error, info, warn};

use crate::discovery::{self, DiscoveryCallbacks};
use crate::net::asr::{AsrCode, AsrRouter, StreamKey};
use crate::net::driver::{AsyncPoll, DatagramToken, Driver, EndpointId, NetError, NetResult, UdpHandle};
use crate::protocol::BUFFER_SIZE;

/// Send FIFO depth. Sized from observed response bursts; a tunable,
/// not an invariant.
pub const MAX_UDP_SEND_QUEUE: usize = 8;

/// One queued outbound datagram.
pub struct UdpSendReq {
    pub payload: heapless::Vec<u8, BUFFER_SIZE>,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
}

/// How an outbound datagram was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the driver immediately.
    Started,
    /// Parked in the send FIFO; the poll loop will start it.
    Queued,
}

pub struct DiscoveryEndpoint {
    endpoint: EndpointId,
    port: u16,
    read_handle: Option<UdpHandle>,
    return_handle: Option<UdpHandle>,
    send_handle: Option<UdpHandle>,
    /// A processed datagram whose buffer return could not start yet.
    deferred_return: Option<DatagramToken>,
    send_fifo: heapless::Deque<UdpSendReq, MAX_UDP_SEND_QUEUE>,
    last_broadcast: Option<u64>,
}

impl DiscoveryEndpoint {
    /// Create the endpoint, register its notifier, and start the
    /// first receive. Rolls the endpoint back on partial failure.
    pub fn open(drv: &mut impl Driver, router: &AsrRouter, port: u16) -> NetResult<Self> {
        let endpoint = drv.udp_create(port, BUFFER_SIZE)?;
        if router.register(StreamKey::Udp(endpoint)).is_err() {
            let _ = drv.udp_release(endpoint);
            return Err(NetError::OutOfMemory);
        }

        let mut ep = Self {
            endpoint,
            port,
            read_handle: None,
            return_handle: None,
            send_handle: None,
            deferred_return: None,
            send_fifo: heapless::Deque::new(),
            last_broadcast: None,
        };
        ep.start_receive(drv);
        info!(target: "discovery", "endpoint open on UDP {port}");
        Ok(ep)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn queued_sends(&self) -> usize {
        self.send_fifo.len()
    }

    // ── Per-tick poll ────────────────────────────────────────

    /// Drain completions, process any arrived packet, restart the
    /// receive when the buffer is back, and pump the send FIFO.
    pub fn poll(&mut self, drv: &mut impl Driver, router: &AsrRouter, cbs: &mut impl DiscoveryCallbacks) {
        self.drain_asr(router);
        self.poll_send(drv);
        self.pump_send_fifo(drv);
        self.poll_return(drv);
        self.poll_receive(drv, cbs);
        self.retry_deferred_return(drv);

        // Nothing in flight and no buffer outstanding: listen again.
        if self.read_handle.is_none()
            && self.return_handle.is_none()
            && self.deferred_return.is_none()
        {
            self.start_receive(drv);
        }
    }

    fn drain_asr(&mut self, router: &AsrRouter) {
        if let Some(ev) = router.take(StreamKey::Udp(self.endpoint)) {
            match ev.code {
                AsrCode::IcmpReceived => warn!(
                    target: "discovery",
                    "ICMP type {} code {} from {}", ev.icmp.msg_type, ev.icmp.code, ev.icmp.src_ip
                ),
                // Arrival is observed through the receive handle.
                AsrCode::DataArrival => {}
                other => debug!(target: "discovery", "endpoint event {other:?}"),
            }
        }
    }

    fn poll_send(&mut self, drv: &mut impl Driver) {
        if let Some(h) = self.send_handle {
            match drv.udp_check_send(h) {
                AsyncPoll::Pending => {}
                AsyncPoll::Complete(Ok(())) => {
                    self.send_handle = None;
                }
                AsyncPoll::Complete(Err(e)) => {
                    warn!(target: "discovery", "datagram send failed: {e}");
                    self.send_handle = None;
                }
            }
        }
    }

    /// Start the next queued datagram once the send slot frees up.
    fn pump_send_fifo(&mut self, drv: &mut impl Driver) {
        if self.send_handle.is_some() {
            return;
        }
        if let Some(req) = self.send_fifo.pop_front() {
            match drv.udp_send_async(self.endpoint, req.dest_ip, req.dest_port, &req.payload) {
                Ok(h) => self.send_handle = Some(h),
                Err(e) => {
                    warn!(target: "discovery", "queued send to {} failed to start: {e}", req.dest_ip);
                    // Transient exhaustion: retry next tick. The slot
                    // we just popped guarantees room.
                    if e == NetError::OutOfMemory || e == NetError::Busy {
                        let _ = self.send_fifo.push_front(req);
                    }
                }
            }
        }
    }

    fn poll_return(&mut self, drv: &mut impl Driver) {
        if let Some(h) = self.return_handle {
            match drv.udp_check_return(h) {
                AsyncPoll::Pending => {}
                AsyncPoll::Complete(result) => {
                    if let Err(e) = result {
                        warn!(target: "discovery", "buffer return failed: {e}");
                    }
                    self.return_handle = None;
                }
            }
        }
    }

    fn poll_receive(&mut self, drv: &mut impl Driver, cbs: &mut impl DiscoveryCallbacks) {
        let Some(h) = self.read_handle else { return };
        match drv.udp_check_receive(h) {
            AsyncPoll::Pending => {}
            AsyncPoll::Complete(Ok(info)) => {
                self.read_handle = None;
                self.handle_datagram(drv, info.remote_ip, info.remote_port, info.token, cbs);
            }
            AsyncPoll::Complete(Err(e)) => {
                warn!(target: "discovery", "receive failed: {e}");
                self.read_handle = None;
            }
        }
    }

    fn handle_datagram(
        &mut self,
        drv: &mut impl Driver,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        token: DatagramToken,
        cbs: &mut impl DiscoveryCallbacks,
    ) {
        if remote_ip == drv.local_ip() {
            // Our own broadcast came back; just recycle the buffer.
            self.return_datagram(drv, token);
            return;
        }

        let outcome = discovery::process_packet(drv.datagram_bytes(&token), remote_ip, remote_port, cbs);
        debug!(target: "discovery", "datagram from {remote_ip}:{remote_port} -> {outcome:?}");
        self.return_datagram(drv, token);
    }

    /// Hand the datagram's buffer back, or defer if a return is
    /// still in flight from the previous tick.
    fn return_datagram(&mut self, drv: &mut impl Driver, token: DatagramToken) {
        if self.return_handle.is_some() {
            debug!(target: "discovery", "buffer return busy, deferring to next tick");
            self.deferred_return = Some(token);
            return;
        }
        match drv.udp_return_buffer_async(self.endpoint, token) {
            Ok(h) => self.return_handle = Some(h),
            // Descriptor exhaustion here would strand the receive
            // buffer; it cannot happen while this endpoint is the
            // pool's only client, so treat it as a driver fault.
            Err(e) => error!(target: "discovery", "buffer return failed to start: {e}"),
        }
    }

    fn retry_deferred_return(&mut self, drv: &mut impl Driver) {
        if self.return_handle.is_none() {
            if let Some(token) = self.deferred_return.take() {
                self.return_datagram(drv, token);
            }
        }
    }

    fn start_receive(&mut self, drv: &mut impl Driver) {
        match drv.udp_receive_async(self.endpoint) {
            Ok(h) => self.read_handle = Some(h),
            Err(e) => warn!(target: "discovery", "receive failed to start: {e}"),
        }
    }

    // ── Outbound ─────────────────────────────────────────────

    /// Send a datagram now, or park it in the FIFO if the send slot
    /// is occupied. `Err(OutOfMemory)` means the FIFO is full; no
    /// state changes in that case.
    pub fn send_or_queue(
        &mut self,
        drv: &mut impl Driver,
        payload: &[u8],
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> NetResult<SendOutcome> {
        if self.send_handle.is_none() {
            let h = drv.udp_send_async(self.endpoint, dest_ip, dest_port, payload)?;
            self.send_handle = Some(h);
            return Ok(SendOutcome::Started);
        }

        let mut req = UdpSendReq {
            payload: heapless::Vec::new(),
            dest_ip,
            dest_port,
        };
        req.payload
            .extend_from_slice(payload)
            .map_err(|()| NetError::InvalidParam)?;
        self.send_fifo
            .push_back(req)
            .map_err(|_| NetError::OutOfMemory)?;
        Ok(SendOutcome::Queued)
    }

    // ── Broadcast scheduler ──────────────────────────────────

    /// Whether the periodic presence broadcast is due.
    pub fn broadcast_due(&self, now: u64, interval_ticks: u64) -> bool {
        match self.last_broadcast {
            None => true,
            Some(t) => now.saturating_sub(t) >= interval_ticks,
        }
    }

    /// Record a successfully initiated broadcast. Failed attempts do
    /// not update the clock, so the next tick retries.
    pub fn mark_broadcast(&mut self, now: u64) {
        self.last_broadcast = Some(now);
    }

    // ── Shutdown ─────────────────────────────────────────────

    /// Best-effort departure notice. Waits up to `max_yields`
    /// cooperative iterations for the send slot, sends, gives the
    /// driver a short window to flush, then proceeds regardless.
    pub fn quit_broadcast(
        &mut self,
        drv: &mut impl Driver,
        router: &AsrRouter,
        payload: &[u8],
        dest_ip: Ipv4Addr,
        dest_port: u16,
        max_yields: u32,
        mut cooperative_yield: impl FnMut(),
    ) {
        let mut budget = max_yields;
        while self.send_handle.is_some() && budget > 0 {
            self.poll_send(drv);
            if self.send_handle.is_some() {
                drv.pump(router);
                cooperative_yield();
                budget -= 1;
            }
        }

        if self.send_handle.is_some() {
            warn!(target: "discovery", "send slot still busy; departure notice skipped");
            return;
        }

        match drv.udp_send_async(self.endpoint, dest_ip, dest_port, payload) {
            Ok(h) => {
                self.send_handle = Some(h);
                while self.send_handle.is_some() && budget > 0 {
                    drv.pump(router);
                    self.poll_send(drv);
                    if self.send_handle.is_some() {
                        cooperative_yield();
                        budget -= 1;
                    }
                }
                info!(target: "discovery", "departure notice sent");
            }
            Err(e) => warn!(target: "discovery", "departure notice failed to start: {e}"),
        }
    }

    /// Cancel anything in flight and release the endpoint.
    pub fn close(mut self, drv: &mut impl Driver, router: &AsrRouter) {
        for h in [self.read_handle.take(), self.return_handle.take(), self.send_handle.take()]
            .into_iter()
            .flatten()
        {
            drv.udp_cancel_async(h);
        }
        router.unregister(StreamKey::Udp(self.endpoint));
        let _ = drv.udp_release(self.endpoint);
    }
}

// ── Tests ────────────────────────────────────────────────────
//
// The overlapped-operation state machine is exercised end to end in
// tests/integration/discovery_tests.rs against the scriptable mock
// driver; only the pure scheduling arithmetic is unit-tested here.
