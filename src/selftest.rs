//! Automated send-path exercise.
//!
//! Drives the outbound API the way a worst-case user would: four
//! rounds, one per second, each firing twelve broadcast messages
//! back to back at up to three active peers (so a full round queues
//! 36 sends, and a full run against three peers moves 144 messages,
//! 48 per peer). The run tallies how each send was accepted (pool
//! slot / queue / rejected) and reports through the log and the
//! event sink. With the standard pool (4) and queue (64), a round's
//! burst fits and nothing should ever be rejected.

use std::net::Ipv4Addr;

use log::{info, warn};

use crate::app::events::SelfTestReport;
use crate::config::TICK_HZ;
use crate::net::driver::{NetError, NetResult};
use crate::net::udp::SendOutcome;

/// Rounds per run.
pub const SELFTEST_ROUNDS: u8 = 4;

/// Broadcast messages fired per round (each goes to every target).
pub const MSGS_PER_ROUND: u32 = 12;

/// At most this many peers are targeted.
pub const MAX_TARGETS: usize = 3;

const ROUND_SPACING_TICKS: u64 = TICK_HZ;

/// One in-progress self-test run.
pub struct SelfTest {
    round: u8,
    next_round_tick: u64,
    peers_targeted: usize,
    started: u32,
    queued: u32,
    rejected: u32,
}

impl SelfTest {
    pub fn new(now: u64) -> Self {
        info!(target: "msg", "self-test: starting ({SELFTEST_ROUNDS} rounds x {MSGS_PER_ROUND} messages)");
        Self {
            round: 0,
            next_round_tick: now,
            peers_targeted: 0,
            started: 0,
            queued: 0,
            rejected: 0,
        }
    }

    /// Advance the run. `targets` is the current active-peer list;
    /// `send` queues one text message. Returns the report when the
    /// run is over.
    pub fn tick(
        &mut self,
        now: u64,
        targets: &[Ipv4Addr],
        mut send: impl FnMut(Ipv4Addr, &str) -> NetResult<SendOutcome>,
    ) -> Option<SelfTestReport> {
        if targets.is_empty() {
            warn!(target: "msg", "self-test: no active peers; aborting");
            return Some(self.report());
        }
        if now < self.next_round_tick {
            return None;
        }

        let targets = &targets[..targets.len().min(MAX_TARGETS)];
        self.peers_targeted = targets.len();
        self.round += 1;

        for i in 0..MSGS_PER_ROUND {
            let content = format!("self-test round {} message {}", self.round, i + 1);
            for &ip in targets {
                match send(ip, &content) {
                    Ok(SendOutcome::Started) => self.started += 1,
                    Ok(SendOutcome::Queued) => self.queued += 1,
                    Err(NetError::OutOfMemory) => {
                        warn!(
                            target: "msg",
                            "self-test: queue full at round {} message {}", self.round, i + 1
                        );
                        self.rejected += 1;
                    }
                    Err(e) => {
                        warn!(target: "msg", "self-test: send to {ip} failed: {e}");
                        self.rejected += 1;
                    }
                }
            }
        }

        info!(
            target: "msg",
            "self-test: round {}/{SELFTEST_ROUNDS} done (started {} queued {} rejected {})",
            self.round, self.started, self.queued, self.rejected
        );

        if self.round >= SELFTEST_ROUNDS {
            let report = self.report();
            info!(
                target: "msg",
                "self-test: finished; {} started, {} queued, {} rejected across {} peers",
                report.messages_started,
                report.messages_queued,
                report.messages_rejected,
                report.peers_targeted
            );
            return Some(report);
        }

        self.next_round_tick = now + ROUND_SPACING_TICKS;
        None
    }

    fn report(&self) -> SelfTestReport {
        SelfTestReport {
            rounds_completed: self.round,
            peers_targeted: self.peers_targeted,
            messages_started: self.started,
            messages_queued: self.queued,
            messages_rejected: self.rejected,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
