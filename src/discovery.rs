//! Discovery packet processing.
//!
//! Pure logic, decoupled from the endpoint that feeds it: the
//! processor is handed a received buffer plus a callback table and
//! decides what the packet means. The caller (the UDP endpoint
//! driver loop) owns the sockets, the roster, and the response
//! queue; this module knows nothing about any of them.

use std::net::Ipv4Addr;

use log::{debug, warn};

use crate::protocol::{self, MsgType};

// ── Callback table ───────────────────────────────────────────

/// Effects the processor may request. Implemented by the service,
/// which binds them to the roster, the event sink, and the UDP send
/// queue.
pub trait DiscoveryCallbacks {
    /// Queue a `DISCOVERY_RESPONSE` to `dest`.
    fn send_response(&mut self, dest_ip: Ipv4Addr, dest_port: u16);

    /// Record a sighting. Returns `true` if the roster changed
    /// (new row, changed name, or reactivation).
    fn add_or_update_peer(&mut self, ip: Ipv4Addr, username: &str) -> bool;

    /// The visible peer list should refresh.
    fn notify_peer_list_updated(&mut self);

    /// A peer announced departure.
    fn mark_peer_inactive(&mut self, ip: Ipv4Addr);
}

/// What a packet turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Discovery,
    DiscoveryResponse,
    Quit,
    /// Unparseable, or a type that does not belong on the discovery
    /// port.
    Ignored,
}

// ── Processor ────────────────────────────────────────────────

/// Interpret one datagram.
///
/// `src_ip`/`src_port` come from the datagram, not from the record:
/// the datagram source is authoritative for roster updates and
/// response targets. The embedded sender-IP string is informational
/// and only logged when it disagrees. Callers filter out this host's
/// own broadcasts before invoking.
pub fn process_packet(
    data: &[u8],
    src_ip: Ipv4Addr,
    src_port: u16,
    cbs: &mut impl DiscoveryCallbacks,
) -> PacketOutcome {
    let msg = match protocol::parse_message(data) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(target: "discovery", "dropping malformed datagram from {src_ip}: {e}");
            return PacketOutcome::Ignored;
        }
    };

    if msg.sender_ip != src_ip {
        debug!(
            target: "discovery",
            "{src_ip} claims to be {} in a {:?} record", msg.sender_ip, msg.msg_type
        );
    }

    match msg.msg_type {
        MsgType::Discovery => {
            debug!(target: "discovery", "DISCOVERY from {} at {src_ip}", msg.username);
            if cbs.add_or_update_peer(src_ip, &msg.username) {
                cbs.notify_peer_list_updated();
            }
            cbs.send_response(src_ip, src_port);
            PacketOutcome::Discovery
        }
        MsgType::DiscoveryResponse => {
            debug!(
                target: "discovery",
                "DISCOVERY_RESPONSE from {} at {src_ip}", msg.username
            );
            if cbs.add_or_update_peer(src_ip, &msg.username) {
                cbs.notify_peer_list_updated();
            }
            PacketOutcome::DiscoveryResponse
        }
        MsgType::Quit => {
            debug!(target: "discovery", "QUIT from {} at {src_ip}", msg.username);
            cbs.mark_peer_inactive(src_ip);
            cbs.notify_peer_list_updated();
            PacketOutcome::Quit
        }
        MsgType::Text => {
            // Text rides TCP; on the discovery port it is noise.
            warn!(target: "discovery", "ignoring TEXT record on discovery port from {src_ip}");
            PacketOutcome::Ignored
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
