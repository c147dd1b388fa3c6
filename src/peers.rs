//! Peer roster — a flat bounded table of known nodes.
//!
//! One row per peer address. Rows are created by discovery traffic,
//! refreshed by any datagram from the peer, greyed out (not removed)
//! when the peer goes quiet or announces departure, and reused for
//! new peers once inactive.

use std::net::Ipv4Addr;

use log::{debug, info};

use crate::protocol::MAX_USERNAME_LEN;

/// Roster capacity.
pub const MAX_PEERS: usize = 32;

/// One roster row.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub username: heapless::String<MAX_USERNAME_LEN>,
    /// Tick of the most recent datagram from this peer.
    pub last_seen: u64,
    pub active: bool,
}

/// Outcome of [`PeerTable::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new row was created.
    Added,
    /// An existing active row was refreshed.
    Updated,
    /// An inactive row came back to life.
    Reactivated,
}

impl AddOutcome {
    /// Whether the visible peer list changed.
    pub fn changed_roster(self) -> bool {
        !matches!(self, Self::Updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RosterFull;

pub struct PeerTable {
    slots: [Option<Peer>; MAX_PEERS],
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PEERS],
        }
    }

    /// Record a sighting of `ip`. Updates the existing row if there
    /// is one, otherwise takes the first free slot, otherwise evicts
    /// the stalest inactive row. A full table of active peers is an
    /// error.
    pub fn add_or_update(
        &mut self,
        ip: Ipv4Addr,
        username: &str,
        now: u64,
    ) -> Result<AddOutcome, RosterFull> {
        let username: heapless::String<MAX_USERNAME_LEN> = {
            let mut end = username.len().min(MAX_USERNAME_LEN);
            while !username.is_char_boundary(end) {
                end -= 1;
            }
            heapless::String::try_from(&username[..end]).map_err(|()| RosterFull)?
        };

        if let Some(peer) = self.slots.iter_mut().flatten().find(|p| p.ip == ip) {
            let reappeared = !peer.active;
            peer.username = username;
            peer.last_seen = now;
            peer.active = true;
            if reappeared {
                info!(target: "peers", "{ip} is back ({})", peer.username);
                return Ok(AddOutcome::Reactivated);
            }
            return Ok(AddOutcome::Updated);
        }

        let slot = match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => slot,
            None => self
                .slots
                .iter_mut()
                .filter(|s| s.as_ref().is_some_and(|p| !p.active))
                .min_by_key(|s| s.as_ref().map_or(0, |p| p.last_seen))
                .ok_or(RosterFull)?,
        };

        info!(target: "peers", "new peer {username} at {ip}");
        *slot = Some(Peer {
            ip,
            username,
            last_seen: now,
            active: true,
        });
        Ok(AddOutcome::Added)
    }

    /// Grey out a peer (departure notice). Returns whether the row
    /// was active.
    pub fn mark_inactive(&mut self, ip: Ipv4Addr) -> bool {
        if let Some(peer) = self.slots.iter_mut().flatten().find(|p| p.ip == ip) {
            let was_active = peer.active;
            peer.active = false;
            if was_active {
                info!(target: "peers", "{ip} left ({})", peer.username);
            }
            return was_active;
        }
        false
    }

    /// Grey out every active peer not heard from within
    /// `timeout_ticks`. Returns how many rows changed.
    pub fn prune_timed_out(&mut self, now: u64, timeout_ticks: u64) -> usize {
        let mut pruned = 0;
        for peer in self.slots.iter_mut().flatten() {
            if peer.active && now.saturating_sub(peer.last_seen) > timeout_ticks {
                peer.active = false;
                pruned += 1;
                debug!(
                    target: "peers",
                    "{} timed out (last seen tick {})", peer.ip, peer.last_seen
                );
            }
        }
        pruned
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|p| p.active)
            .count()
    }

    /// Row at flat slot index `i`, occupied or not.
    pub fn get_by_index(&self, i: usize) -> Option<&Peer> {
        self.slots.get(i).and_then(Option::as_ref)
    }

    pub fn iter_active(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().flatten().filter(|p| p.active)
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────
