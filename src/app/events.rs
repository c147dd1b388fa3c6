//! Outbound application events.
//!
//! The [`MessengerService`](super::service::MessengerService) emits
//! these through the [`EventSink`](super::ports::EventSink) port.
//! Adapters on the other side decide what to do with them — render
//! to the terminal, append to the log, record in a test.

use std::net::Ipv4Addr;

use crate::net::driver::NetError;
use crate::protocol::{MAX_CONTENT_LEN, MAX_USERNAME_LEN};

/// Structured events emitted by the application core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// The service is up (carries the announced identity).
    Started {
        username: heapless::String<MAX_USERNAME_LEN>,
        local_ip: Ipv4Addr,
    },

    /// The visible peer list changed; `active` is the new count.
    PeerListUpdated { active: usize },

    /// A text message arrived.
    MessageReceived {
        username: heapless::String<MAX_USERNAME_LEN>,
        ip: Ipv4Addr,
        content: heapless::String<MAX_CONTENT_LEN>,
    },

    /// An outbound message could not be sent or queued.
    SendFailed { ip: Ipv4Addr, reason: NetError },

    /// The outbound queue is full; try again shortly.
    NetworkBusy,

    /// The self-test harness finished a run.
    SelfTestReport(SelfTestReport),

    /// Shutdown has begun; the departure notice is going out.
    ShuttingDown,
}

/// Tallies from one self-test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfTestReport {
    pub rounds_completed: u8,
    pub peers_targeted: usize,
    pub messages_started: u32,
    pub messages_queued: u32,
    pub messages_rejected: u32,
}
