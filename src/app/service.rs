//! Application service — the hexagonal core.
//!
//! [`MessengerService`] owns the roster and both network engines and
//! runs the per-tick order the whole system hangs off:
//!
//! 1. UDP endpoint poll (completions, packet processing, send FIFO)
//! 2. TCP engine (listen events → pool entries → queue → listen)
//! 3. Discovery broadcast interval
//! 4. Periodic roster prune
//!
//! The driver and the event sink are injected at call sites, so the
//! entire service runs against the scriptable mock in tests.

use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::config::{SystemConfig, TICK_HZ};
use crate::discovery::DiscoveryCallbacks;
use crate::error::{Error, Result};
use crate::net::asr::AsrRouter;
use crate::net::driver::{Driver, NetError};
use crate::net::tcp::{MessageEvents, TcpEngine};
use crate::net::udp::{DiscoveryEndpoint, SendOutcome};
use crate::peers::PeerTable;
use crate::protocol::{self, BUFFER_SIZE, MsgIdGen, MsgType, NodeIdentity};
use crate::selftest::SelfTest;

use super::commands::AppCommand;
use super::events::AppEvent;
use super::ports::EventSink;

// ───────────────────────────────────────────────────────────────
// Callback glue
// ───────────────────────────────────────────────────────────────
//
// The engines talk to callback tables, not to the service directly.
// These two adapters bind the tables to the roster and the sink.
// Discovery responses are recorded rather than sent inline: the
// endpoint cannot be re-entered while it is being polled.

struct DiscoveryGlue<'a, S: EventSink> {
    peers: &'a mut PeerTable,
    sink: &'a mut S,
    now: u64,
    response_to: Option<(Ipv4Addr, u16)>,
}

impl<S: EventSink> DiscoveryCallbacks for DiscoveryGlue<'_, S> {
    fn send_response(&mut self, dest_ip: Ipv4Addr, dest_port: u16) {
        self.response_to = Some((dest_ip, dest_port));
    }

    fn add_or_update_peer(&mut self, ip: Ipv4Addr, username: &str) -> bool {
        match self.peers.add_or_update(ip, username, self.now) {
            Ok(outcome) => outcome.changed_roster(),
            Err(_) => {
                warn!(target: "peers", "roster full; cannot track {ip}");
                false
            }
        }
    }

    fn notify_peer_list_updated(&mut self) {
        self.sink.emit(&AppEvent::PeerListUpdated {
            active: self.peers.active_count(),
        });
    }

    fn mark_peer_inactive(&mut self, ip: Ipv4Addr) {
        let _ = self.peers.mark_inactive(ip);
    }
}

struct MessageGlue<'a, S: EventSink> {
    peers: &'a mut PeerTable,
    sink: &'a mut S,
    now: u64,
}

impl<S: EventSink> MessageEvents for MessageGlue<'_, S> {
    fn peer_seen(&mut self, ip: Ipv4Addr, username: &str) {
        match self.peers.add_or_update(ip, username, self.now) {
            Ok(outcome) if outcome.changed_roster() => {
                self.sink.emit(&AppEvent::PeerListUpdated {
                    active: self.peers.active_count(),
                });
            }
            Ok(_) => {}
            Err(_) => warn!(target: "peers", "roster full; cannot track {ip}"),
        }
    }

    fn text_message(&mut self, username: &str, ip: Ipv4Addr, content: &str) {
        let Ok(username) = heapless::String::try_from(username) else {
            return;
        };
        let Ok(content) = heapless::String::try_from(content) else {
            return;
        };
        self.sink.emit(&AppEvent::MessageReceived {
            username,
            ip,
            content,
        });
    }

    fn peer_left(&mut self, ip: Ipv4Addr) {
        if self.peers.mark_inactive(ip) {
            self.sink.emit(&AppEvent::PeerListUpdated {
                active: self.peers.active_count(),
            });
        }
    }
}

// ───────────────────────────────────────────────────────────────
// MessengerService
// ───────────────────────────────────────────────────────────────

pub struct MessengerService {
    ident: NodeIdentity,
    id_gen: MsgIdGen,
    peers: PeerTable,
    router: AsrRouter,
    udp: Option<DiscoveryEndpoint>,
    tcp: TcpEngine,
    selftest: Option<SelfTest>,

    // Config-derived constants.
    udp_port: u16,
    broadcast_ip: Ipv4Addr,
    discovery_interval_ticks: u64,
    peer_timeout_ticks: u64,
    connection_timeout_ticks: u64,
    prune_interval_ticks: u64,

    last_prune: u64,
    shut_down: bool,
}

impl MessengerService {
    /// Bring up both engines. On partial failure everything created
    /// so far is rolled back before the error is returned.
    pub fn init(drv: &mut impl Driver, config: &SystemConfig) -> Result<Self> {
        config.validate().map_err(Error::Init)?;
        let ident = NodeIdentity::new(&config.username, drv.local_ip())
            .ok_or(Error::Init("invalid username"))?;

        let router = AsrRouter::new();
        let udp = DiscoveryEndpoint::open(drv, &router, config.udp_port).map_err(Error::Net)?;
        let tcp = match TcpEngine::open(drv, &router, config.tcp_port) {
            Ok(tcp) => tcp,
            Err(e) => {
                udp.close(drv, &router);
                return Err(Error::Net(e));
            }
        };

        info!(
            target: "sys",
            "messenger up as {} at {} ({})",
            ident.username, ident.local_ip, drv.implementation_name()
        );

        Ok(Self {
            ident,
            id_gen: MsgIdGen::new(),
            peers: PeerTable::new(),
            router,
            udp: Some(udp),
            tcp,
            selftest: None,
            udp_port: config.udp_port,
            broadcast_ip: config.broadcast_ip(),
            discovery_interval_ticks: config.discovery_interval_ticks(),
            peer_timeout_ticks: config.peer_timeout_ticks(),
            connection_timeout_ticks: config.connection_timeout_ticks(),
            prune_interval_ticks: config.prune_interval_ticks(),
            last_prune: 0,
            shut_down: false,
        })
    }

    /// Announce startup through the sink.
    pub fn start(&mut self, sink: &mut impl EventSink) {
        sink.emit(&AppEvent::Started {
            username: self.ident.username.clone(),
            local_ip: self.ident.local_ip,
        });
    }

    // ── Per-tick orchestration ────────────────────────────────

    /// Run one full tick. Call from the host loop at every quiet
    /// moment.
    pub fn tick(&mut self, drv: &mut impl Driver, sink: &mut impl EventSink, now: u64) {
        if self.shut_down {
            return;
        }

        drv.pump(&self.router);
        self.router.drain_dropped(|slot, n| {
            warn!(target: "net", "event slot {slot}: {n} event(s) dropped while pending");
        });

        // 1. UDP discovery endpoint.
        if let Some(udp) = self.udp.as_mut() {
            let mut glue = DiscoveryGlue {
                peers: &mut self.peers,
                sink,
                now,
                response_to: None,
            };
            udp.poll(drv, &self.router, &mut glue);

            if let Some((dest_ip, dest_port)) = glue.response_to {
                Self::send_discovery_record(
                    drv,
                    udp,
                    &self.ident,
                    &mut self.id_gen,
                    MsgType::DiscoveryResponse,
                    dest_ip,
                    dest_port,
                );
            }
        }

        // 2. TCP engine.
        {
            let mut glue = MessageGlue {
                peers: &mut self.peers,
                sink,
                now,
            };
            self.tcp.tick(
                drv,
                &self.router,
                now,
                self.connection_timeout_ticks,
                &self.ident,
                &mut self.id_gen,
                &mut glue,
            );
        }

        // 3. Discovery broadcast interval.
        if let Some(udp) = self.udp.as_mut() {
            if udp.broadcast_due(now, self.discovery_interval_ticks) {
                let started = Self::send_discovery_record(
                    drv,
                    udp,
                    &self.ident,
                    &mut self.id_gen,
                    MsgType::Discovery,
                    self.broadcast_ip,
                    self.udp_port,
                );
                if started {
                    udp.mark_broadcast(now);
                }
            }
        }

        // 4. Periodic roster prune.
        if now.saturating_sub(self.last_prune) >= self.prune_interval_ticks {
            self.last_prune = now;
            let pruned = self.peers.prune_timed_out(now, self.peer_timeout_ticks);
            if pruned > 0 {
                sink.emit(&AppEvent::PeerListUpdated {
                    active: self.peers.active_count(),
                });
            }
        }

        self.selftest_tick(drv, sink, now);
    }

    /// Format and hand one discovery-family record to the endpoint.
    /// Returns whether the datagram was started or queued.
    fn send_discovery_record(
        drv: &mut impl Driver,
        udp: &mut DiscoveryEndpoint,
        ident: &NodeIdentity,
        id_gen: &mut MsgIdGen,
        msg_type: MsgType,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> bool {
        let mut buf = [0u8; BUFFER_SIZE];
        let len = match protocol::format_message(
            &mut buf,
            msg_type,
            id_gen.next(),
            &ident.username,
            ident.local_ip,
            "",
        ) {
            Ok(len) => len,
            Err(e) => {
                warn!(target: "discovery", "cannot format {msg_type:?}: {e}");
                return false;
            }
        };

        match udp.send_or_queue(drv, &buf[..len], dest_ip, dest_port) {
            Ok(_) => true,
            Err(e) => {
                debug!(target: "discovery", "{msg_type:?} to {dest_ip} not sent: {e}");
                false
            }
        }
    }

    // ── Command handling ──────────────────────────────────────

    /// Process an external command. `SetDebugLogging` belongs to the
    /// logging adapter and is not handled here.
    pub fn handle_command(
        &mut self,
        cmd: AppCommand,
        drv: &mut impl Driver,
        sink: &mut impl EventSink,
        now: u64,
        cooperative_yield: impl FnMut(),
    ) {
        match cmd {
            AppCommand::SendText { peer_ip, content } => {
                self.send_text(drv, sink, now, peer_ip, &content);
            }
            AppCommand::Broadcast { content } => {
                let targets: heapless::Vec<Ipv4Addr, { crate::peers::MAX_PEERS }> =
                    self.peers.iter_active().map(|p| p.ip).collect();
                if targets.is_empty() {
                    info!(target: "msg", "no active peers to broadcast to");
                }
                for ip in targets {
                    self.send_text(drv, sink, now, ip, &content);
                }
            }
            AppCommand::RunSelfTest => {
                if self.selftest.is_none() {
                    self.selftest = Some(SelfTest::new(now));
                }
            }
            AppCommand::Quit => self.shutdown(drv, sink, cooperative_yield),
            AppCommand::SetDebugLogging(_) => {}
        }
    }

    /// Queue one text message. Success means sent *or* queued; only
    /// a full queue (or a bad address) surfaces to the sink.
    pub fn send_text(
        &mut self,
        drv: &mut impl Driver,
        sink: &mut impl EventSink,
        now: u64,
        peer_ip: Ipv4Addr,
        content: &str,
    ) {
        match self.tcp.queue_message(
            drv,
            now,
            &self.ident,
            &mut self.id_gen,
            peer_ip,
            content,
            MsgType::Text,
        ) {
            Ok(SendOutcome::Started) => {}
            Ok(SendOutcome::Queued) => {
                debug!(target: "msg", "message to {peer_ip} queued");
            }
            Err(NetError::OutOfMemory) => {
                warn!(target: "msg", "outbound queue full; message to {peer_ip} rejected");
                sink.emit(&AppEvent::NetworkBusy);
            }
            Err(reason) => {
                warn!(target: "msg", "cannot send to {peer_ip}: {reason}");
                sink.emit(&AppEvent::SendFailed { ip: peer_ip, reason });
            }
        }
    }

    fn selftest_tick(&mut self, drv: &mut impl Driver, sink: &mut impl EventSink, now: u64) {
        let Some(mut st) = self.selftest.take() else {
            return;
        };

        let targets: heapless::Vec<Ipv4Addr, { crate::peers::MAX_PEERS }> =
            self.peers.iter_active().map(|p| p.ip).collect();

        let tcp = &mut self.tcp;
        let ident = &self.ident;
        let id_gen = &mut self.id_gen;
        let report = st.tick(now, &targets, |ip, content| {
            tcp.queue_message(drv, now, ident, id_gen, ip, content, MsgType::Text)
        });

        match report {
            Some(report) => sink.emit(&AppEvent::SelfTestReport(report)),
            None => self.selftest = Some(st),
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.ident
    }

    pub fn idle_send_slots(&self) -> usize {
        self.tcp.idle_slots()
    }

    pub fn queued_messages(&self) -> usize {
        self.tcp.queued_messages()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // ── Shutdown ──────────────────────────────────────────────

    /// Best-effort departure notice, then release everything. Never
    /// blocks beyond the one-second quit grace.
    pub fn shutdown(
        &mut self,
        drv: &mut impl Driver,
        sink: &mut impl EventSink,
        cooperative_yield: impl FnMut(),
    ) {
        if self.shut_down {
            return;
        }
        sink.emit(&AppEvent::ShuttingDown);

        if let Some(mut udp) = self.udp.take() {
            let mut buf = [0u8; BUFFER_SIZE];
            if let Ok(len) = protocol::format_message(
                &mut buf,
                MsgType::Quit,
                self.id_gen.next(),
                &self.ident.username,
                self.ident.local_ip,
                "",
            ) {
                udp.quit_broadcast(
                    drv,
                    &self.router,
                    &buf[..len],
                    self.broadcast_ip,
                    self.udp_port,
                    TICK_HZ as u32,
                    cooperative_yield,
                );
            }
            udp.close(drv, &self.router);
        }

        self.tcp.shutdown(drv, &self.router);
        drv.shutdown();
        self.shut_down = true;
        info!(target: "sys", "messenger shut down");
    }
}
