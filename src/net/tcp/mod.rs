//! TCP messaging engine.
//!
//! Glues the three pieces together: the dedicated listen slot, the
//! outbound send pool, and the bounded message queue that feeds it.
//! Inbound records surface through [`MessageEvents`]; the service
//! binds those to the roster and the UI sink.

pub mod listen;
pub mod pool;
pub mod queue;

use std::net::Ipv4Addr;

use log::{debug, warn};

use crate::net::asr::AsrRouter;
use crate::net::driver::{Driver, NetError, NetResult};
use crate::net::udp::SendOutcome;
use crate::protocol::{MsgIdGen, MsgType, NodeIdentity};

use listen::ListenSlot;
use pool::{EntryState, SendPool};
use queue::{OutboundQueue, QueuedMessage};

// ── Inbound dispatch table ───────────────────────────────────

/// Effects of inbound TCP records. Implemented by the service.
pub trait MessageEvents {
    /// A record arrived from `ip`; refresh the roster row.
    fn peer_seen(&mut self, ip: Ipv4Addr, username: &str);

    /// Display a received text message.
    fn text_message(&mut self, username: &str, ip: Ipv4Addr, content: &str);

    /// A peer sent a departure notice over TCP.
    fn peer_left(&mut self, ip: Ipv4Addr);
}

// ── Engine ───────────────────────────────────────────────────

pub struct TcpEngine {
    listen: ListenSlot,
    pool: SendPool,
    queue: OutboundQueue,
}

impl TcpEngine {
    /// Bring up the listen slot and the send pool. Rolls back on
    /// partial failure.
    pub fn open(drv: &mut impl Driver, router: &AsrRouter, msg_port: u16) -> NetResult<Self> {
        let mut listen = ListenSlot::open(drv, router, msg_port)?;
        let pool = match SendPool::open(drv, router, msg_port) {
            Ok(pool) => pool,
            Err(e) => {
                listen.shutdown(drv, router);
                return Err(e);
            }
        };
        Ok(Self {
            listen,
            pool,
            queue: OutboundQueue::new(),
        })
    }

    /// Send now if a pool entry is idle, otherwise park the message
    /// in the queue. Only a full queue surfaces as an error.
    pub fn queue_message(
        &mut self,
        drv: &mut impl Driver,
        now: u64,
        ident: &NodeIdentity,
        id_gen: &mut MsgIdGen,
        peer_ip: Ipv4Addr,
        content: &str,
        msg_type: MsgType,
    ) -> NetResult<SendOutcome> {
        if let Some(idx) = self.pool.find_idle() {
            match self
                .pool
                .start_on_entry(drv, idx, now, ident, id_gen, peer_ip, content, msg_type)
            {
                Ok(()) => return Ok(SendOutcome::Started),
                Err(NetError::InvalidParam) => return Err(NetError::InvalidParam),
                Err(e) => {
                    // The slot could not take it right now; fall
                    // through to the queue.
                    debug!(target: "msg", "direct start failed ({e}); queueing");
                }
            }
        }

        let content = heapless::String::try_from(content).map_err(|()| NetError::InvalidParam)?;
        self.queue.enqueue(QueuedMessage {
            peer_ip,
            msg_type,
            content,
        })?;
        Ok(SendOutcome::Queued)
    }

    /// One full engine tick:
    /// listen events → pool entries (events, state machine, sweep) →
    /// queue pump → listen handler.
    pub fn tick(
        &mut self,
        drv: &mut impl Driver,
        router: &AsrRouter,
        now: u64,
        timeout_ticks: u64,
        ident: &NodeIdentity,
        id_gen: &mut MsgIdGen,
        events: &mut impl MessageEvents,
    ) {
        self.listen.drain_asr(drv, router);

        for idx in 0..self.pool.len() {
            let _ = self.pool.tick_entry(drv, router, idx, now, timeout_ticks);
        }

        self.pump_queue(drv, now, ident, id_gen);
        self.listen.run(drv, events);
    }

    /// Match at most one queued message with a newly idle slot.
    fn pump_queue(
        &mut self,
        drv: &mut impl Driver,
        now: u64,
        ident: &NodeIdentity,
        id_gen: &mut MsgIdGen,
    ) {
        if self.queue.is_empty() {
            return;
        }
        let Some(idx) = self.pool.find_idle() else {
            return;
        };
        let Some(msg) = self.queue.dequeue() else {
            return;
        };
        if let Err(e) = self.pool.start_on_entry(
            drv,
            idx,
            now,
            ident,
            id_gen,
            msg.peer_ip,
            &msg.content,
            msg.msg_type,
        ) {
            // Discarded, not requeued: retrying a broken target
            // forever would livelock the queue against it.
            warn!(
                target: "msg",
                "queued {:?} to {} dropped: {e}", msg.msg_type, msg.peer_ip
            );
        }
    }

    // ── Introspection ────────────────────────────────────────

    pub fn idle_slots(&self) -> usize {
        self.pool.idle_count()
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    pub fn pool_entry_state(&self, idx: usize) -> Option<EntryState> {
        self.pool.entry_state(idx)
    }

    pub fn listen_state(&self) -> listen::ListenState {
        self.listen.state()
    }

    // ── Shutdown ─────────────────────────────────────────────

    pub fn shutdown(&mut self, drv: &mut impl Driver, router: &AsrRouter) {
        self.pool.shutdown(drv, router);
        self.listen.shutdown(drv, router);
    }
}
