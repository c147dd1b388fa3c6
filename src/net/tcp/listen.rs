//! Passive listen slot.
//!
//! One dedicated stream accepts inbound connections. The protocol is
//! stateless — one record per connection, sender closes after the
//! read — so the slot runs a tight loop: accept, probe for the
//! already-arrived record, abort, **relisten, and only then** parse
//! and dispatch.
//!
//! Relisten-before-processing is a first-class correctness rule, not
//! a nicety: it caps the gap between consecutive accept-able moments
//! at the abort+listen cost, which is what lets a burst of inbound
//! connections land on a driver that only supports one connection
//! per stream.

use log::{debug, info, warn};

use crate::net::asr::{AsrCode, AsrRouter, StreamKey};
use crate::net::driver::{
    AsyncPoll, Driver, NetError, NetResult, StreamId, TcpCompletion, TcpHandle,
};
use crate::net::tcp::MessageEvents;
use crate::protocol::{self, MsgType};

/// Receive-descriptor entries requested per probe.
pub const MAX_RDS_ENTRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Idle,
    Listening,
    /// A connection is accepted; transient within one tick.
    ConnectedIn,
}

pub struct ListenSlot {
    stream: StreamId,
    state: ListenState,
    listen_handle: Option<TcpHandle>,
    port: u16,
}

impl ListenSlot {
    /// Create the stream, register its notifier, and start
    /// listening.
    pub fn open(drv: &mut impl Driver, router: &AsrRouter, port: u16) -> NetResult<Self> {
        let stream = drv.tcp_create()?;
        if router.register(StreamKey::Tcp(stream)).is_err() {
            let _ = drv.tcp_release(stream);
            return Err(NetError::OutOfMemory);
        }
        let mut slot = Self {
            stream,
            state: ListenState::Idle,
            listen_handle: None,
            port,
        };
        slot.ensure_listening(drv);
        info!(target: "net", "listening on TCP {port}");
        Ok(slot)
    }

    pub fn state(&self) -> ListenState {
        self.state
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Drain this stream's event slot. Run before the send-pool
    /// entries each tick.
    pub fn drain_asr(&mut self, drv: &mut impl Driver, router: &AsrRouter) {
        let Some(ev) = router.take(StreamKey::Tcp(self.stream)) else {
            return;
        };
        match ev.code {
            AsrCode::Terminate | AsrCode::Closing => {
                // Whatever ended — the remote hanging up mid-accept,
                // or the "ULP close" that follows our own abort — the
                // slot must never go silent. If nothing is listening,
                // listen again.
                debug!(
                    target: "net",
                    "listen: {:?} ({:?}) in {:?}", ev.code, ev.reason, self.state
                );
                if self.state == ListenState::ConnectedIn {
                    drv.tcp_abort(self.stream);
                    self.state = ListenState::Idle;
                }
                if self.listen_handle.is_none() {
                    self.ensure_listening(drv);
                }
            }
            code => debug!(target: "net", "listen: event {code:?}"),
        }
    }

    /// The per-tick state handler.
    pub fn run(&mut self, drv: &mut impl Driver, events: &mut impl MessageEvents) {
        match self.state {
            ListenState::Idle => self.ensure_listening(drv),
            ListenState::Listening => self.poll_accept(drv, events),
            ListenState::ConnectedIn => {
                // Accepts are fully handled in the tick they
                // complete; a lingering ConnectedIn means the probe
                // path was interrupted. Recover.
                drv.tcp_abort(self.stream);
                self.state = ListenState::Idle;
                self.ensure_listening(drv);
            }
        }
    }

    fn ensure_listening(&mut self, drv: &mut impl Driver) {
        if self.listen_handle.is_some() {
            self.state = ListenState::Listening;
            return;
        }
        match drv.tcp_listen_async(self.stream, self.port) {
            Ok(h) => {
                self.listen_handle = Some(h);
                self.state = ListenState::Listening;
            }
            Err(e) => {
                warn!(target: "net", "listen failed to start: {e}");
                self.state = ListenState::Idle;
            }
        }
    }

    fn poll_accept(&mut self, drv: &mut impl Driver, events: &mut impl MessageEvents) {
        let Some(h) = self.listen_handle else {
            self.state = ListenState::Idle;
            return;
        };
        match drv.tcp_check_async(h) {
            AsyncPoll::Pending => {}
            AsyncPoll::Complete(Ok(TcpCompletion::Listen { remote_ip, remote_port })) => {
                self.listen_handle = None;
                self.state = ListenState::ConnectedIn;
                debug!(target: "net", "accepted {remote_ip}:{remote_port}");
                self.handle_accept(drv, events, remote_ip);
            }
            AsyncPoll::Complete(Ok(other)) => {
                self.listen_handle = None;
                warn!(target: "net", "listen completed as {other:?}");
                self.state = ListenState::Idle;
            }
            AsyncPoll::Complete(Err(e)) => {
                self.listen_handle = None;
                warn!(target: "net", "listen failed: {e}");
                self.state = ListenState::Idle;
            }
        }
    }

    fn handle_accept(
        &mut self,
        drv: &mut impl Driver,
        events: &mut impl MessageEvents,
        remote_ip: std::net::Ipv4Addr,
    ) {
        // Zero-timeout probe: the sender pushes its record with the
        // connect, so the data is normally in the buffer already.
        let batch = match drv.tcp_receive_no_copy(self.stream, MAX_RDS_ENTRIES) {
            Ok(Some(batch)) if !batch.is_empty() => Some(batch),
            Ok(_) => None,
            Err(e) => {
                debug!(target: "net", "probe failed: {e}");
                None
            }
        };

        // Release the connection and get the next listen armed
        // BEFORE any record processing. Holding the stream in its
        // accepted state would block further accepts until parsing
        // and dispatch finish.
        drv.tcp_abort(self.stream);
        self.state = ListenState::Idle;
        self.ensure_listening(drv);

        let Some(batch) = batch else {
            debug!(target: "net", "no data from {remote_ip}; relistening");
            return;
        };

        match protocol::parse_message(drv.rds_bytes(&batch)) {
            Ok(msg) => {
                if msg.sender_ip != remote_ip {
                    debug!(
                        target: "net",
                        "{remote_ip} claims to be {} in a {:?} record", msg.sender_ip, msg.msg_type
                    );
                }
                match msg.msg_type {
                    MsgType::Text => {
                        events.peer_seen(remote_ip, &msg.username);
                        events.text_message(&msg.username, remote_ip, &msg.content);
                    }
                    MsgType::Quit => {
                        events.peer_left(remote_ip);
                    }
                    other => {
                        warn!(target: "net", "ignoring {other:?} record over TCP from {remote_ip}");
                    }
                }
            }
            Err(e) => {
                warn!(target: "net", "dropping malformed record from {remote_ip}: {e}");
            }
        }

        // Hand the receive descriptors back last; the buffer stays
        // valid until here because the relistened stream has not
        // received anything yet.
        if let Err(e) = drv.tcp_return_buffer(self.stream, batch) {
            warn!(target: "net", "buffer return failed: {e}");
        }
    }

    // ── Shutdown ─────────────────────────────────────────────

    pub fn shutdown(&mut self, drv: &mut impl Driver, router: &AsrRouter) {
        if let Some(h) = self.listen_handle.take() {
            drv.tcp_cancel_async(h);
        }
        drv.tcp_abort(self.stream);
        router.unregister(StreamKey::Tcp(self.stream));
        let _ = drv.tcp_release(self.stream);
        self.state = ListenState::Idle;
    }
}

// ── Tests ────────────────────────────────────────────────────
//
// Accept ordering (abort → relisten → parse → return) and the
// burst-accept property are covered in
// tests/integration/listen_tests.rs against the mock driver, which
// records the order of driver calls.
