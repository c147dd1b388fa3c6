//! Outbound TCP scenarios: the connect→send→close walk, refused
//! connects, timeout sweeping, queue backpressure, and the burst
//! self-test.

use lanmsg::app::commands::AppCommand;
use lanmsg::app::events::AppEvent;
use lanmsg::net::driver::Driver;
use lanmsg::protocol::{MsgType, parse_message};

use crate::support::{UDP_PORT, ip, make_node, record};

#[test]
fn directed_text_walks_connect_send_close() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    let bob = ip(11);
    service.send_text(&mut drv, &mut sink, 0, bob, "hello");
    assert_eq!(service.idle_send_slots(), 3, "one slot taken");

    // Connect completes, send goes out, close completes.
    for now in 1..6 {
        service.tick(&mut drv, &mut sink, now);
    }

    assert_eq!(service.idle_send_slots(), 4, "slot idle again");
    assert_eq!(drv.handles_outstanding().tcp_in_use, 0, "no leaked handles");

    let sent = drv.tcp_sent.first().expect("nothing sent");
    assert_eq!(sent.dest, bob);
    let msg = parse_message(&sent.bytes).unwrap();
    assert_eq!(msg.msg_type, MsgType::Text);
    assert_eq!(msg.username.as_str(), "alice");
    assert_eq!(msg.sender_ip, ip(10));
    assert_eq!(msg.content.as_str(), "hello");

    // The established connection was closed gracefully, not aborted.
    assert!(drv.log_index("close_async(1)").is_some());

    // No failure surfaced.
    assert!(!sink.events.iter().any(|e| matches!(e, AppEvent::SendFailed { .. })));
}

#[test]
fn remote_close_after_send_is_success() {
    // The receiver reads one record and closes; the terminate event
    // must not be treated as a failure.
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    let bob = ip(11);
    service.send_text(&mut drv, &mut sink, 0, bob, "hi");
    let stream = drv.streams_connected_to(bob)[0];
    drv.set_close_after_send(stream);

    for now in 1..8 {
        service.tick(&mut drv, &mut sink, now);
    }

    assert_eq!(service.idle_send_slots(), 4);
    assert_eq!(drv.handles_outstanding().tcp_in_use, 0);
    assert_eq!(drv.tcp_sent.len(), 1);
    assert!(!sink.events.iter().any(|e| matches!(e, AppEvent::SendFailed { .. })));
}

#[test]
fn refused_connect_returns_slot_within_one_tick() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    // No listener at .99: the connect will be refused.
    let dead = ip(99);
    service.send_text(&mut drv, &mut sink, 0, dead, "anyone there?");
    let stream = drv.streams_connected_to(dead)[0];
    drv.refuse_next_connect(stream);
    drv.clear_log();

    // One tick: pump posts the terminate event, the entry goes idle,
    // and the residual poll frees the descriptor.
    service.tick(&mut drv, &mut sink, 1);
    assert_eq!(service.idle_send_slots(), 4, "slot back to idle");
    assert_eq!(drv.handles_outstanding().tcp_in_use, 0, "descriptor freed");

    // No retry: the message is discarded, not re-queued.
    for now in 2..10 {
        service.tick(&mut drv, &mut sink, now);
    }
    assert!(drv.call_log().iter().all(|c| !c.starts_with("connect_async")));
    assert!(drv.tcp_sent.is_empty());
    assert_eq!(service.queued_messages(), 0);
}

#[test]
fn stuck_connect_is_swept_at_timeout() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);
    drv.auto_connect = false; // connect never completes

    let bob = ip(11);
    service.send_text(&mut drv, &mut sink, 0, bob, "stuck");
    service.tick(&mut drv, &mut sink, 1);
    assert_eq!(service.idle_send_slots(), 3);

    // Just before the 1800-tick deadline: still connecting.
    service.tick(&mut drv, &mut sink, 1799);
    assert_eq!(service.idle_send_slots(), 3);

    // Past it: cancelled, aborted, idle, no leaked descriptor.
    service.tick(&mut drv, &mut sink, 1801);
    assert_eq!(service.idle_send_slots(), 4);
    assert_eq!(drv.handles_outstanding().tcp_in_use, 0);
}

#[test]
fn saturated_pool_queues_then_drains() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);
    drv.auto_connect = false; // hold all four slots in ConnectingOut

    for i in 0..6 {
        service.send_text(&mut drv, &mut sink, 0, ip(20 + i), "burst");
    }
    service.tick(&mut drv, &mut sink, 1);
    assert_eq!(service.idle_send_slots(), 0);
    assert_eq!(service.queued_messages(), 2);

    // Let connects finish: the queue drains one per newly idle slot.
    drv.auto_connect = true;
    for now in 2..30 {
        service.tick(&mut drv, &mut sink, now);
    }
    assert_eq!(service.queued_messages(), 0);
    assert_eq!(drv.tcp_sent.len(), 6);
    assert_eq!(service.idle_send_slots(), 4);
}

#[test]
fn full_queue_reports_network_busy() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);
    drv.auto_connect = false;

    // 4 slots + 64 queue entries fill; the 69th is rejected.
    for i in 0..68 {
        service.send_text(&mut drv, &mut sink, 0, ip(21), &format!("m{i}"));
    }
    assert_eq!(service.queued_messages(), 64);
    assert!(!sink.events.iter().any(|e| matches!(e, AppEvent::NetworkBusy)));

    service.send_text(&mut drv, &mut sink, 0, ip(21), "one too many");
    assert_eq!(service.queued_messages(), 64, "no state change on reject");
    assert!(sink.events.iter().any(|e| matches!(e, AppEvent::NetworkBusy)));
}

#[test]
fn selftest_burst_is_never_rejected() {
    // 4 rounds x 12 broadcasts x 3 peers = 144 messages, pool 4,
    // queue 64: nothing may be rejected, every peer sees 48 records.
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    for (i, name) in ["bob", "carol", "dave"].into_iter().enumerate() {
        let peer = ip(11 + i as u8);
        drv.deliver_udp(UDP_PORT, peer, UDP_PORT, &record(MsgType::Discovery, 1, name, peer, ""));
    }
    // Each datagram needs a receive tick and a buffer-return tick.
    for now in 1..9 {
        service.tick(&mut drv, &mut sink, now);
    }
    assert_eq!(service.peers().active_count(), 3);

    service.handle_command(AppCommand::RunSelfTest, &mut drv, &mut sink, 10, || {});
    for now in 10..700 {
        service.tick(&mut drv, &mut sink, now);
    }

    let report = sink.selftest_report().expect("no report emitted");
    assert_eq!(report.rounds_completed, 4);
    assert_eq!(report.peers_targeted, 3);
    assert_eq!(report.messages_rejected, 0);
    assert_eq!(
        report.messages_started + report.messages_queued,
        144,
        "every message accepted"
    );

    assert_eq!(drv.tcp_sent.len(), 144);
    for peer in [ip(11), ip(12), ip(13)] {
        let count = drv.tcp_sent.iter().filter(|s| s.dest == peer).count();
        assert_eq!(count, 48, "peer {peer} got {count} records");
    }
}

#[test]
fn shutdown_sends_quit_and_releases_everything() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    service.handle_command(AppCommand::Quit, &mut drv, &mut sink, 5, || {});
    assert!(service.is_shut_down());

    let quit = drv
        .udp_sent
        .iter()
        .find(|s| {
            parse_message(&s.bytes).is_ok_and(|m| m.msg_type == MsgType::Quit)
        })
        .expect("no QUIT datagram went out");
    assert_eq!(quit.dest, std::net::Ipv4Addr::BROADCAST);
    assert_eq!(quit.port, UDP_PORT);

    // Further ticks are inert.
    service.tick(&mut drv, &mut sink, 6);
    assert!(sink.events.iter().any(|e| matches!(e, AppEvent::ShuttingDown)));
}
