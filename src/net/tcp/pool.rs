//! Outbound TCP send pool.
//!
//! A fixed pool of reusable streams, each with an independent state
//! machine walking one message through connect → send → close:
//!
//! ```text
//!        ┌──────┐ start  ┌───────────────┐ connect ok ┌─────────┐
//!        │ Idle │───────▶│ ConnectingOut │───────────▶│ Sending │
//!        └──────┘        └───────┬───────┘            └────┬────┘
//!           ▲   refused / error  │            send done    │
//!           ├────────────────────┘                         │
//!           │              ┌─────────────────┐  established │
//!           ├──────────────│ ClosingGraceful │◀────────────┤
//!           │   close done └─────────────────┘              │
//!           └──────────────────── abort ◀── QUIT / not-established
//! ```
//!
//! Handle discipline, restated because it is the chief hazard: the
//! event-capture path updates *state only*. Driver handles are freed
//! exclusively by the main loop calling `tcp_check_async`, the one
//! call that both reads the completion result and performs the free.
//! An entry parked in `Idle` with residual handles (event arrived
//! before the poll ran) polls each of them once per tick until they
//! drain.

use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::net::asr::{AsrCode, AsrRouter, StreamKey, TerminateReason};
use crate::net::driver::{
    AsyncPoll, Driver, NetError, NetResult, StreamId, TcpHandle,
};
use crate::protocol::{self, BUFFER_SIZE, MsgIdGen, MsgType, NodeIdentity};

/// Pool width: 4 on the standard build, 2 on the memory-constrained
/// build.
pub const TCP_POOL_SIZE: usize = if cfg!(feature = "compact-pool") { 2 } else { 4 };

// ── Entry state machine ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Uninitialized,
    Idle,
    ConnectingOut,
    ConnectedOut,
    Sending,
    ClosingGraceful,
    Aborting,
    Releasing,
    Error,
}

pub struct PoolEntry {
    stream: StreamId,
    state: EntryState,
    target_ip: Ipv4Addr,
    msg_type: MsgType,
    /// The formatted wire record for the in-flight message.
    message: heapless::Vec<u8, BUFFER_SIZE>,
    connect_started: u64,
    send_started: u64,
    connect_handle: Option<TcpHandle>,
    send_handle: Option<TcpHandle>,
    close_handle: Option<TcpHandle>,
    index: usize,
}

impl PoolEntry {
    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    fn reset_message(&mut self) {
        self.message.clear();
        self.target_ip = Ipv4Addr::UNSPECIFIED;
    }

    fn has_residual_handles(&self) -> bool {
        self.connect_handle.is_some() || self.send_handle.is_some() || self.close_handle.is_some()
    }
}

// ── Pool ─────────────────────────────────────────────────────

pub struct SendPool {
    entries: heapless::Vec<PoolEntry, TCP_POOL_SIZE>,
    msg_port: u16,
}

impl SendPool {
    /// Create every stream up front and register its notifier.
    /// Rolls back all prior allocations on failure.
    pub fn open(drv: &mut impl Driver, router: &AsrRouter, msg_port: u16) -> NetResult<Self> {
        let mut pool = Self {
            entries: heapless::Vec::new(),
            msg_port,
        };

        for index in 0..TCP_POOL_SIZE {
            let stream = match drv.tcp_create() {
                Ok(s) => s,
                Err(e) => {
                    pool.rollback(drv, router);
                    return Err(e);
                }
            };
            if router.register(StreamKey::Tcp(stream)).is_err() {
                let _ = drv.tcp_release(stream);
                pool.rollback(drv, router);
                return Err(NetError::OutOfMemory);
            }
            let _ = pool.entries.push(PoolEntry {
                stream,
                state: EntryState::Idle,
                target_ip: Ipv4Addr::UNSPECIFIED,
                msg_type: MsgType::Text,
                message: heapless::Vec::new(),
                connect_started: 0,
                send_started: 0,
                connect_handle: None,
                send_handle: None,
                close_handle: None,
                index,
            });
        }

        info!(target: "net", "send pool ready ({TCP_POOL_SIZE} slots)");
        Ok(pool)
    }

    fn rollback(&mut self, drv: &mut impl Driver, router: &AsrRouter) {
        while let Some(entry) = self.entries.pop() {
            router.unregister(StreamKey::Tcp(entry.stream));
            let _ = drv.tcp_release(entry.stream);
        }
    }

    /// First idle entry, if any. No entry is reserved for any target;
    /// FIFO fairness comes from the outbound queue, not slot choice.
    pub fn find_idle(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.state == EntryState::Idle)
    }

    pub fn idle_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Idle)
            .count()
    }

    pub fn entry_state(&self, idx: usize) -> Option<EntryState> {
        self.entries.get(idx).map(|e| e.state)
    }

    // ── Starting a send ──────────────────────────────────────

    /// Format the message and start the connect on entry `idx`.
    /// Reverts the entry to idle on synchronous failure.
    pub fn start_on_entry(
        &mut self,
        drv: &mut impl Driver,
        idx: usize,
        now: u64,
        ident: &NodeIdentity,
        id_gen: &mut MsgIdGen,
        peer_ip: Ipv4Addr,
        content: &str,
        msg_type: MsgType,
    ) -> NetResult<()> {
        if peer_ip.is_unspecified() || peer_ip.is_broadcast() {
            return Err(NetError::InvalidParam);
        }
        let entry = self.entries.get_mut(idx).ok_or(NetError::InvalidParam)?;
        if entry.state != EntryState::Idle {
            return Err(NetError::Busy);
        }

        let mut buf = [0u8; BUFFER_SIZE];
        let len = protocol::format_message(
            &mut buf,
            msg_type,
            id_gen.next(),
            &ident.username,
            ident.local_ip,
            content,
        )
        .map_err(|_| NetError::InvalidParam)?;

        entry.message.clear();
        let _ = entry.message.extend_from_slice(&buf[..len]);
        entry.target_ip = peer_ip;
        entry.msg_type = msg_type;

        match drv.tcp_connect_async(entry.stream, peer_ip, self.msg_port) {
            Ok(h) => {
                entry.connect_handle = Some(h);
                entry.connect_started = now;
                entry.state = EntryState::ConnectingOut;
                debug!(
                    target: "net",
                    "slot {idx}: connecting to {peer_ip}:{} ({:?})", self.msg_port, msg_type
                );
                Ok(())
            }
            Err(e) => {
                entry.reset_message();
                entry.state = EntryState::Idle;
                warn!(target: "net", "slot {idx}: connect to {peer_ip} failed to start: {e}");
                Err(e)
            }
        }
    }

    // ── Per-tick work ────────────────────────────────────────

    /// Drain the entry's event slot, run its state machine, then
    /// sweep its timeout. Returns the entry's resulting state.
    pub fn tick_entry(
        &mut self,
        drv: &mut impl Driver,
        router: &AsrRouter,
        idx: usize,
        now: u64,
        timeout_ticks: u64,
    ) -> EntryState {
        let Some(entry) = self.entries.get_mut(idx) else {
            return EntryState::Error;
        };

        if let Some(ev) = router.take(StreamKey::Tcp(entry.stream)) {
            Self::handle_event(entry, ev.code, ev.reason);
        }
        Self::step(drv, entry, now);
        Self::sweep(drv, entry, now, timeout_ticks);
        entry.state
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Event-capture dispatch. Updates state only; never touches a
    /// handle (the main-loop poll frees them).
    fn handle_event(entry: &mut PoolEntry, code: AsrCode, reason: TerminateReason) {
        match (code, entry.state) {
            (AsrCode::Terminate, EntryState::ConnectingOut) => {
                if reason == TerminateReason::RemoteClose {
                    warn!(
                        target: "net",
                        "slot {}: connection to {} refused", entry.index, entry.target_ip
                    );
                } else {
                    warn!(
                        target: "net",
                        "slot {}: connect terminated ({reason:?})", entry.index
                    );
                }
                entry.reset_message();
                entry.state = EntryState::Idle;
            }
            (AsrCode::Terminate, EntryState::ConnectedOut | EntryState::Sending) => {
                // The receiver reads one message and closes; a remote
                // close here is the normal end of a successful send.
                if matches!(reason, TerminateReason::RemoteClose | TerminateReason::UlpClose) {
                    debug!(
                        target: "net",
                        "slot {}: remote closed after read", entry.index
                    );
                } else {
                    warn!(
                        target: "net",
                        "slot {}: terminated mid-send ({reason:?})", entry.index
                    );
                }
                entry.reset_message();
                entry.state = EntryState::Idle;
            }
            (AsrCode::Terminate, EntryState::ClosingGraceful) => {
                debug!(target: "net", "slot {}: terminated while closing", entry.index);
                entry.state = EntryState::Idle;
            }
            (AsrCode::Terminate, EntryState::Idle) => {
                // Follows our own abort; expected.
                debug!(
                    target: "net",
                    "slot {}: late terminate ({reason:?})", entry.index
                );
            }
            (AsrCode::Closing, _) => {
                debug!(target: "net", "slot {}: remote began close", entry.index);
            }
            (code, state) => {
                debug!(target: "net", "slot {}: event {code:?} in {state:?}", entry.index);
            }
        }
    }

    fn step(drv: &mut impl Driver, entry: &mut PoolEntry, now: u64) {
        match entry.state {
            EntryState::Idle => {
                // Residual handles: the event path moved us here
                // before the poll ran. Poll each once to free it.
                if entry.has_residual_handles() {
                    Self::poll_residuals(drv, entry);
                }
            }

            EntryState::ConnectingOut => {
                let Some(h) = entry.connect_handle else {
                    entry.state = EntryState::Idle;
                    return;
                };
                match drv.tcp_check_async(h) {
                    AsyncPoll::Pending => {}
                    AsyncPoll::Complete(Ok(_)) => {
                        entry.connect_handle = None;
                        entry.state = EntryState::ConnectedOut;
                        Self::begin_send(drv, entry, now);
                    }
                    AsyncPoll::Complete(Err(e)) => {
                        entry.connect_handle = None;
                        warn!(
                            target: "net",
                            "slot {}: connect to {} failed: {e}", entry.index, entry.target_ip
                        );
                        drv.tcp_abort(entry.stream);
                        entry.reset_message();
                        entry.state = EntryState::Idle;
                    }
                }
            }

            EntryState::ConnectedOut => {
                // Normally transited within the connect-completion
                // tick; reaching here means the send has not started
                // yet.
                Self::begin_send(drv, entry, now);
            }

            EntryState::Sending => {
                let Some(h) = entry.send_handle else {
                    entry.state = EntryState::Idle;
                    return;
                };
                match drv.tcp_check_async(h) {
                    AsyncPoll::Pending => {}
                    AsyncPoll::Complete(Ok(_)) => {
                        entry.send_handle = None;
                        Self::finish_send(drv, entry);
                    }
                    AsyncPoll::Complete(Err(e)) => {
                        entry.send_handle = None;
                        warn!(target: "net", "slot {}: send failed: {e}", entry.index);
                        drv.tcp_abort(entry.stream);
                        entry.reset_message();
                        entry.state = EntryState::Idle;
                    }
                }
            }

            EntryState::ClosingGraceful => {
                let Some(h) = entry.close_handle else {
                    entry.state = EntryState::Idle;
                    return;
                };
                match drv.tcp_check_async(h) {
                    AsyncPoll::Pending => {}
                    AsyncPoll::Complete(result) => {
                        entry.close_handle = None;
                        if let Err(e) = result {
                            debug!(target: "net", "slot {}: close ended with {e}", entry.index);
                            drv.tcp_abort(entry.stream);
                        }
                        entry.state = EntryState::Idle;
                    }
                }
            }

            EntryState::Uninitialized
            | EntryState::Aborting
            | EntryState::Releasing
            | EntryState::Error => {}
        }
    }

    /// Connect finished: push the message out with push set so the
    /// receiver's probe sees it immediately.
    fn begin_send(drv: &mut impl Driver, entry: &mut PoolEntry, now: u64) {
        match drv.tcp_send_async(entry.stream, &entry.message, true) {
            Ok(h) => {
                entry.send_handle = Some(h);
                entry.send_started = now;
                entry.state = EntryState::Sending;
            }
            Err(e) => {
                warn!(target: "net", "slot {}: send failed to start: {e}", entry.index);
                drv.tcp_abort(entry.stream);
                entry.reset_message();
                entry.state = EntryState::Idle;
            }
        }
    }

    /// Send finished: decide between graceful close and abort.
    fn finish_send(drv: &mut impl Driver, entry: &mut PoolEntry) {
        debug!(
            target: "net",
            "slot {}: {:?} delivered to {}", entry.index, entry.msg_type, entry.target_ip
        );

        if entry.msg_type == MsgType::Quit {
            // Departure notices don't linger for the close handshake.
            drv.tcp_abort(entry.stream);
            entry.reset_message();
            entry.state = EntryState::Idle;
            return;
        }

        let graceful = matches!(
            drv.tcp_status(entry.stream),
            Ok(st) if st.state.reached_established()
        );
        if graceful {
            match drv.tcp_close_async(entry.stream) {
                Ok(h) => {
                    entry.close_handle = Some(h);
                    entry.state = EntryState::ClosingGraceful;
                    entry.reset_message();
                    return;
                }
                Err(e) => {
                    debug!(target: "net", "slot {}: async close unavailable: {e}", entry.index);
                }
            }
        }
        // Already closed, mid-transition, or close unavailable.
        drv.tcp_abort(entry.stream);
        entry.reset_message();
        entry.state = EntryState::Idle;
    }

    fn poll_residuals(drv: &mut impl Driver, entry: &mut PoolEntry) {
        for slot in [
            &mut entry.connect_handle,
            &mut entry.send_handle,
            &mut entry.close_handle,
        ] {
            if let Some(h) = *slot {
                if !drv.tcp_check_async(h).is_pending() {
                    *slot = None;
                }
            }
        }
    }

    /// Cap stuck peers: entries connecting or sending past the
    /// deadline are cancelled, aborted, and returned to idle.
    fn sweep(drv: &mut impl Driver, entry: &mut PoolEntry, now: u64, timeout_ticks: u64) {
        let started = match entry.state {
            EntryState::ConnectingOut => entry.connect_started,
            EntryState::Sending => entry.send_started,
            _ => return,
        };
        if now.saturating_sub(started) <= timeout_ticks {
            return;
        }

        warn!(
            target: "net",
            "slot {}: {:?} to {} timed out", entry.index, entry.state, entry.target_ip
        );
        for slot in [
            &mut entry.connect_handle,
            &mut entry.send_handle,
            &mut entry.close_handle,
        ] {
            if let Some(h) = slot.take() {
                drv.tcp_cancel_async(h);
            }
        }
        drv.tcp_abort(entry.stream);
        entry.reset_message();
        entry.state = EntryState::Idle;
    }

    // ── Shutdown ─────────────────────────────────────────────

    pub fn shutdown(&mut self, drv: &mut impl Driver, router: &AsrRouter) {
        for entry in &mut self.entries {
            entry.state = EntryState::Releasing;
            for slot in [
                &mut entry.connect_handle,
                &mut entry.send_handle,
                &mut entry.close_handle,
            ] {
                if let Some(h) = slot.take() {
                    drv.tcp_cancel_async(h);
                }
            }
            drv.tcp_abort(entry.stream);
            router.unregister(StreamKey::Tcp(entry.stream));
            let _ = drv.tcp_release(entry.stream);
        }
        self.entries.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────
//
// The connect/send/close walk, the refused-connect event path, and
// the timeout sweep are exercised against the scriptable mock driver
// in tests/integration/messaging_tests.rs.
