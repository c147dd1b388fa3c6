//! Engine-level tests driving the UDP endpoint and the TCP engine
//! directly (no service), pinning down the overlapped-operation
//! guards that the scenario tests only exercise incidentally.

use std::net::Ipv4Addr;

use lanmsg::discovery::DiscoveryCallbacks;
use lanmsg::net::asr::AsrRouter;
use lanmsg::net::driver::{Driver, NetError};
use lanmsg::net::tcp::TcpEngine;
use lanmsg::net::tcp::pool::TCP_POOL_SIZE;
use lanmsg::net::udp::{DiscoveryEndpoint, MAX_UDP_SEND_QUEUE, SendOutcome};
use lanmsg::protocol::{MsgIdGen, MsgType, NodeIdentity};

use crate::support::{UDP_PORT, ip};
use crate::mock_driver::MockDriver;

// ── Minimal callback table ───────────────────────────────────

#[derive(Default)]
struct NullCallbacks;

impl DiscoveryCallbacks for NullCallbacks {
    fn send_response(&mut self, _dest_ip: Ipv4Addr, _dest_port: u16) {}
    fn add_or_update_peer(&mut self, _ip: Ipv4Addr, _username: &str) -> bool {
        false
    }
    fn notify_peer_list_updated(&mut self) {}
    fn mark_peer_inactive(&mut self, _ip: Ipv4Addr) {}
}

fn endpoint() -> (MockDriver, AsrRouter, DiscoveryEndpoint) {
    let mut drv = MockDriver::new(ip(10));
    let router = AsrRouter::new();
    let ep = DiscoveryEndpoint::open(&mut drv, &router, UDP_PORT).expect("endpoint open");
    (drv, router, ep)
}

// ── UDP send FIFO ────────────────────────────────────────────

#[test]
fn send_fifo_absorbs_exactly_its_capacity() {
    let (mut drv, _router, mut ep) = endpoint();

    // First send occupies the slot...
    assert_eq!(
        ep.send_or_queue(&mut drv, b"first", ip(50), UDP_PORT).unwrap(),
        SendOutcome::Started
    );
    // ...the next eight park in the FIFO...
    for i in 0..MAX_UDP_SEND_QUEUE {
        assert_eq!(
            ep.send_or_queue(&mut drv, b"queued", ip(51 + i as u8), UDP_PORT)
                .unwrap(),
            SendOutcome::Queued
        );
    }
    assert_eq!(ep.queued_sends(), MAX_UDP_SEND_QUEUE);

    // ...and the ninth is refused without disturbing the queue.
    assert_eq!(
        ep.send_or_queue(&mut drv, b"overflow", ip(99), UDP_PORT),
        Err(NetError::OutOfMemory)
    );
    assert_eq!(ep.queued_sends(), MAX_UDP_SEND_QUEUE);
}

#[test]
fn send_fifo_drains_in_order() {
    let (mut drv, router, mut ep) = endpoint();
    let mut cbs = NullCallbacks;

    let _ = ep.send_or_queue(&mut drv, b"a", ip(50), UDP_PORT).unwrap();
    let _ = ep.send_or_queue(&mut drv, b"b", ip(51), UDP_PORT).unwrap();
    let _ = ep.send_or_queue(&mut drv, b"c", ip(52), UDP_PORT).unwrap();

    // One datagram completes per poll; the FIFO feeds the slot.
    for _ in 0..6 {
        ep.poll(&mut drv, &router, &mut cbs);
    }

    let dests: Vec<_> = drv.udp_sent.iter().map(|s| s.dest).collect();
    assert_eq!(dests, vec![ip(50), ip(51), ip(52)]);
    assert_eq!(ep.queued_sends(), 0);
}

#[test]
fn at_most_one_send_in_flight() {
    let (mut drv, router, mut ep) = endpoint();
    let mut cbs = NullCallbacks;
    drv.stall_sends = 100; // nothing completes

    let _ = ep.send_or_queue(&mut drv, b"a", ip(50), UDP_PORT).unwrap();
    let _ = ep.send_or_queue(&mut drv, b"b", ip(51), UDP_PORT).unwrap();
    for _ in 0..5 {
        ep.poll(&mut drv, &router, &mut cbs);
    }

    // Only the first send ever reached the driver; the second is
    // still parked.
    let starts = drv
        .call_log()
        .iter()
        .filter(|c| c.starts_with("udp_send_async"))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(ep.queued_sends(), 1);
}

// ── Quit broadcast ───────────────────────────────────────────

#[test]
fn quit_broadcast_waits_for_the_slot_then_sends() {
    let (mut drv, router, mut ep) = endpoint();

    // A send is in flight but completes after a few polls.
    drv.stall_sends = 3;
    let _ = ep.send_or_queue(&mut drv, b"pending", ip(50), UDP_PORT).unwrap();

    let mut yields = 0;
    ep.quit_broadcast(
        &mut drv,
        &router,
        b"goodbye",
        Ipv4Addr::BROADCAST,
        UDP_PORT,
        20,
        || yields += 1,
    );

    assert!(yields > 0, "had to wait for the slot");
    let last = drv.udp_sent.last().expect("nothing sent");
    assert_eq!(last.bytes, b"goodbye");
    assert_eq!(last.dest, Ipv4Addr::BROADCAST);
}

#[test]
fn quit_broadcast_gives_up_after_the_grace_period() {
    let (mut drv, router, mut ep) = endpoint();

    // The in-flight send never completes.
    drv.stall_sends = u32::MAX;
    let _ = ep.send_or_queue(&mut drv, b"stuck", ip(50), UDP_PORT).unwrap();

    ep.quit_broadcast(
        &mut drv,
        &router,
        b"goodbye",
        Ipv4Addr::BROADCAST,
        UDP_PORT,
        10,
        || {},
    );

    // Best effort: the notice is skipped rather than blocking.
    assert!(drv.udp_sent.iter().all(|s| s.bytes != b"goodbye"));
}

// ── TCP engine edges ─────────────────────────────────────────

fn engine() -> (MockDriver, AsrRouter, TcpEngine, NodeIdentity, MsgIdGen) {
    let mut drv = MockDriver::new(ip(10));
    let router = AsrRouter::new();
    let engine = TcpEngine::open(&mut drv, &router, 8766).expect("engine open");
    let ident = NodeIdentity::new("alice", ip(10)).unwrap();
    (drv, router, engine, ident, MsgIdGen::new())
}

struct NullEvents;

impl lanmsg::net::tcp::MessageEvents for NullEvents {
    fn peer_seen(&mut self, _ip: Ipv4Addr, _username: &str) {}
    fn text_message(&mut self, _username: &str, _ip: Ipv4Addr, _content: &str) {}
    fn peer_left(&mut self, _ip: Ipv4Addr) {}
}

#[test]
fn queue_message_rejects_broadcast_and_unspecified_targets() {
    let (mut drv, _router, mut engine, ident, mut ids) = engine();

    for bad in [Ipv4Addr::UNSPECIFIED, Ipv4Addr::BROADCAST] {
        assert_eq!(
            engine.queue_message(&mut drv, 0, &ident, &mut ids, bad, "x", MsgType::Text),
            Err(NetError::InvalidParam)
        );
    }
    assert_eq!(engine.idle_slots(), TCP_POOL_SIZE);
    assert_eq!(engine.queued_messages(), 0);
}

#[test]
fn quit_messages_abort_instead_of_closing_gracefully() {
    let (mut drv, router, mut engine, ident, mut ids) = engine();
    let mut events = NullEvents;

    let bob = ip(11);
    engine
        .queue_message(&mut drv, 0, &ident, &mut ids, bob, "", MsgType::Quit)
        .unwrap();
    for now in 1..6 {
        engine.tick(&mut drv, &router, now, 1800, &ident, &mut ids, &mut events);
    }

    assert_eq!(engine.idle_slots(), TCP_POOL_SIZE);
    assert_eq!(drv.tcp_sent.len(), 1);
    // The stream was aborted, never gracefully closed.
    assert!(drv.call_log().iter().all(|c| !c.starts_with("close_async")));
    assert_eq!(drv.handles_outstanding().tcp_in_use, 1, "only the listen");
}

#[test]
fn descriptor_occupancy_stays_bounded_over_a_soak() {
    let (mut drv, router, mut engine, ident, mut ids) = engine();
    let mut events = NullEvents;

    // Hundreds of messages over many ticks: descriptor occupancy
    // must never exceed the pool width plus the listen handle.
    let mut sent = 0;
    for now in 0..2000u64 {
        if sent < 300 && now % 3 == 0 {
            let _ = engine.queue_message(
                &mut drv,
                now,
                &ident,
                &mut ids,
                ip(20 + (sent % 5) as u8),
                "soak",
                MsgType::Text,
            );
            sent += 1;
        }
        engine.tick(&mut drv, &router, now, 1800, &ident, &mut ids, &mut events);

        let usage = drv.handles_outstanding();
        assert!(
            usage.tcp_in_use <= 1 + TCP_POOL_SIZE,
            "descriptor leak at tick {now}: {} in use", usage.tcp_in_use
        );
    }

    // Everything delivered, nothing stuck.
    assert_eq!(drv.tcp_sent.len(), 300);
    assert_eq!(engine.queued_messages(), 0);
    assert_eq!(drv.handles_outstanding().tcp_in_use, 1);
}
