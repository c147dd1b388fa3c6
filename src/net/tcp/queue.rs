//! Outbound message queue.
//!
//! Absorbs bursts that outrun the send pool. Capacity is sized from
//! observed burst traffic (the self-test fires 4 rounds × 12
//! messages); a tunable, not an invariant. Enqueue on a full queue
//! fails without blocking and without disturbing queued entries;
//! dequeue happens only when a pool entry goes idle.

use std::net::Ipv4Addr;

use crate::net::driver::{NetError, NetResult};
use crate::protocol::{MAX_CONTENT_LEN, MsgType};

/// Queue depth.
pub const MAX_QUEUED_MESSAGES: usize = 64;

/// One message waiting for a pool entry.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub peer_ip: Ipv4Addr,
    pub msg_type: MsgType,
    pub content: heapless::String<MAX_CONTENT_LEN>,
}

pub struct OutboundQueue {
    fifo: heapless::Deque<QueuedMessage, MAX_QUEUED_MESSAGES>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self {
            fifo: heapless::Deque::new(),
        }
    }

    pub fn enqueue(&mut self, msg: QueuedMessage) -> NetResult<()> {
        self.fifo.push_back(msg).map_err(|_| NetError::OutOfMemory)
    }

    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.fifo.pop_front()
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    pub fn capacity(&self) -> usize {
        MAX_QUEUED_MESSAGES
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────
