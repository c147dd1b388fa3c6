//! Driver event capture — single-slot mailboxes with notifier routing.
//!
//! Drivers report network events (remote close, reset, ICMP) from a
//! foreign context: an interrupt-style callback, or a helper thread
//! inside the driver. That context may not allocate, may not touch
//! movable memory, and may not call back into the engine. All it may
//! do is deposit an event here.
//!
//! ```text
//! ┌──────────────┐   post(key, ev)   ┌─────────────────────┐
//! │ driver event │──────────────────▶│ AsrRouter            │
//! │ context      │   (lock-free)     │  [key → AsrSlot] ×8  │
//! └──────────────┘                   └──────────┬──────────┘
//!                                               │ take(key)
//!                                               ▼
//!                                         main loop drain
//! ```
//!
//! Each stream gets one slot. Producer discipline: write the event
//! payload first, then store `pending` with Release ordering. A
//! second event arriving while `pending` is still set is dropped and
//! counted; the main loop drains the counter and logs the drops.
//! Consumer discipline: Acquire-load `pending`, snapshot the payload,
//! clear `pending`, then dispatch.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::net::Ipv4Addr;

use crate::net::driver::{EndpointId, StreamId};

/// Registry capacity: 1 listen stream + the send pool + the UDP
/// endpoint, with slack.
pub const MAX_STREAM_NOTIFIERS: usize = 8;

// ── Event payload ────────────────────────────────────────────

/// What happened on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrCode {
    /// The connection is gone; see the [`TerminateReason`].
    Terminate,
    /// The remote side started an orderly close.
    Closing,
    /// Unread data arrived.
    DataArrival,
    /// Urgent data arrived.
    Urgent,
    /// An ICMP report was delivered for this stream's traffic.
    IcmpReceived,
}

/// Why a connection terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    None,
    /// The remote end refused, reset, or closed the connection.
    /// Under the one-message-per-connection protocol this is the
    /// *normal* end of a successful send.
    RemoteClose,
    NetworkFailure,
    UlpTimeout,
    UlpAbort,
    /// Our own close/abort completed.
    UlpClose,
    Unknown,
}

/// Fixed-size ICMP report, copied field by field in the event
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpReport {
    pub src_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub msg_type: u8,
    pub code: u8,
}

impl IcmpReport {
    pub const fn empty() -> Self {
        Self {
            src_ip: Ipv4Addr::UNSPECIFIED,
            dest_ip: Ipv4Addr::UNSPECIFIED,
            msg_type: 0,
            code: 0,
        }
    }
}

/// One captured event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsrEvent {
    pub code: AsrCode,
    pub reason: TerminateReason,
    pub icmp: IcmpReport,
}

impl AsrEvent {
    pub const fn terminate(reason: TerminateReason) -> Self {
        Self {
            code: AsrCode::Terminate,
            reason,
            icmp: IcmpReport::empty(),
        }
    }

    pub const fn simple(code: AsrCode) -> Self {
        Self {
            code,
            reason: TerminateReason::None,
            icmp: IcmpReport::empty(),
        }
    }
}

// ── Single-slot mailbox ──────────────────────────────────────

/// SPSC mailbox for one stream. Producer is the driver's event
/// context; consumer is the main loop.
pub struct AsrSlot {
    pending: AtomicBool,
    dropped: AtomicU32,
    event: UnsafeCell<AsrEvent>,
}

// SAFETY: `event` is only written while `pending` is false (producer
// side, before the Release store) and only read while `pending` is
// true (consumer side, after the Acquire load). The pending flag's
// Release/Acquire pair orders the payload accesses; there is exactly
// one producer and one consumer per slot.
unsafe impl Sync for AsrSlot {}

impl AsrSlot {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            dropped: AtomicU32::new(0),
            event: UnsafeCell::new(AsrEvent::simple(AsrCode::DataArrival)),
        }
    }

    /// Producer side. Returns `false` if an earlier event is still
    /// unconsumed (the new event is dropped and counted).
    pub fn post(&self, ev: AsrEvent) -> bool {
        if self.pending.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // SAFETY: pending is false, so the consumer is not reading.
        unsafe {
            *self.event.get() = ev;
        }
        self.pending.store(true, Ordering::Release);
        true
    }

    /// Consumer side. Snapshots and clears the slot before the
    /// caller dispatches, so a fresh event may land during dispatch.
    pub fn take(&self) -> Option<AsrEvent> {
        if !self.pending.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: pending is true, so the producer is not writing.
        let ev = unsafe { *self.event.get() };
        self.pending.store(false, Ordering::Release);
        Some(ev)
    }

    /// Drain and reset the dropped-event counter.
    pub fn drain_dropped(&self) -> u32 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

// ── Notifier registry ────────────────────────────────────────

/// Key identifying which stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKey {
    Tcp(StreamId),
    Udp(EndpointId),
}

const KEY_FREE: u16 = 0;

fn encode_key(key: StreamKey) -> u16 {
    match key {
        StreamKey::Tcp(StreamId(s)) => 0x0100 | u16::from(s),
        StreamKey::Udp(EndpointId(e)) => 0x0200 | u16::from(e),
    }
}

struct RouterEntry {
    /// Encoded [`StreamKey`], or [`KEY_FREE`]. Atomic so that
    /// registration from the main loop is visible to the driver's
    /// event context without locks.
    key: AtomicU16,
    slot: AsrSlot,
}

impl RouterEntry {
    const fn new() -> Self {
        Self {
            key: AtomicU16::new(KEY_FREE),
            slot: AsrSlot::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrError {
    RegistryFull,
    DuplicateKey,
}

/// Bounded registry mapping stream identities to their mailboxes.
/// Lookup is a linear scan over at most [`MAX_STREAM_NOTIFIERS`]
/// entries, cheap enough for the event context.
pub struct AsrRouter {
    entries: [RouterEntry; MAX_STREAM_NOTIFIERS],
}

impl AsrRouter {
    pub const fn new() -> Self {
        Self {
            entries: [const { RouterEntry::new() }; MAX_STREAM_NOTIFIERS],
        }
    }

    /// Register a stream. Must happen before the driver can post
    /// events for it.
    pub fn register(&self, key: StreamKey) -> Result<(), AsrError> {
        let encoded = encode_key(key);
        if self.find(encoded).is_some() {
            return Err(AsrError::DuplicateKey);
        }
        for entry in &self.entries {
            if entry
                .key
                .compare_exchange(KEY_FREE, encoded, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(AsrError::RegistryFull)
    }

    /// Remove a stream's registration. Any unconsumed event is
    /// discarded.
    pub fn unregister(&self, key: StreamKey) {
        let encoded = encode_key(key);
        if let Some(entry) = self.find(encoded) {
            let _ = entry.slot.take();
            let _ = entry.slot.drain_dropped();
            entry.key.store(KEY_FREE, Ordering::Release);
        }
    }

    /// Producer side: deposit an event for `key`. Returns `false`
    /// when the key is unregistered or the slot was still pending.
    pub fn post(&self, key: StreamKey, ev: AsrEvent) -> bool {
        match self.find(encode_key(key)) {
            Some(entry) => entry.slot.post(ev),
            None => false,
        }
    }

    /// Consumer side: drain the event for `key`, if any.
    pub fn take(&self, key: StreamKey) -> Option<AsrEvent> {
        self.find(encode_key(key)).and_then(|e| e.slot.take())
    }

    /// Report and reset per-slot dropped-event counts.
    pub fn drain_dropped(&self, mut report: impl FnMut(usize, u32)) {
        for (i, entry) in self.entries.iter().enumerate() {
            let n = entry.slot.drain_dropped();
            if n > 0 {
                report(i, n);
            }
        }
    }

    fn find(&self, encoded: u16) -> Option<&RouterEntry> {
        debug_assert_ne!(encoded, KEY_FREE);
        self.entries
            .iter()
            .find(|e| e.key.load(Ordering::Acquire) == encoded)
    }
}

impl Default for AsrRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────
