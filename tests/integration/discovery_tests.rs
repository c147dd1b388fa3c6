//! Discovery-path scenarios: broadcast scheduling, roster updates,
//! response traffic, departure notices, and the overlapped
//! buffer-return discipline.

use lanmsg::app::events::AppEvent;
use lanmsg::protocol::{MsgType, parse_message};

use crate::support::{UDP_PORT, ip, make_node, record};

#[test]
fn first_tick_broadcasts_presence() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));

    service.tick(&mut drv, &mut sink, 0);
    service.tick(&mut drv, &mut sink, 1); // send completes on this poll

    let bcast = drv
        .udp_sent
        .iter()
        .find(|s| s.dest == std::net::Ipv4Addr::BROADCAST)
        .expect("no broadcast sent");
    assert_eq!(bcast.port, UDP_PORT);

    let msg = parse_message(&bcast.bytes).unwrap();
    assert_eq!(msg.msg_type, MsgType::Discovery);
    assert_eq!(msg.username.as_str(), "alice");
    assert_eq!(msg.sender_ip, ip(10));
}

#[test]
fn broadcast_respects_interval() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));

    for now in 0..599 {
        service.tick(&mut drv, &mut sink, now);
    }
    let after_first = drv.udp_sent.len();
    assert_eq!(after_first, 1, "exactly one broadcast inside the interval");

    service.tick(&mut drv, &mut sink, 600);
    service.tick(&mut drv, &mut sink, 601);
    assert_eq!(drv.udp_sent.len(), 2, "second broadcast at the interval");
}

#[test]
fn discovery_registers_peer_and_responds() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    let bob = ip(11);
    drv.deliver_udp(UDP_PORT, bob, UDP_PORT, &record(MsgType::Discovery, 1, "bob", bob, ""));

    service.tick(&mut drv, &mut sink, 1);
    service.tick(&mut drv, &mut sink, 2); // response send completes

    // Roster has bob.
    assert_eq!(service.peers().active_count(), 1);
    let peer = service.peers().iter_active().next().unwrap();
    assert_eq!(peer.username.as_str(), "bob");
    assert_eq!(peer.ip, bob);

    // One list refresh.
    assert_eq!(sink.list_updates(), 1);

    // A DISCOVERY_RESPONSE went back to bob at the discovery port.
    let resp = drv
        .udp_sent
        .iter()
        .find(|s| s.dest == bob)
        .expect("no response sent");
    assert_eq!(resp.port, UDP_PORT);
    let msg = parse_message(&resp.bytes).unwrap();
    assert_eq!(msg.msg_type, MsgType::DiscoveryResponse);
    assert_eq!(msg.username.as_str(), "alice");
}

#[test]
fn response_registers_without_responding() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    let carol = ip(12);
    drv.deliver_udp(
        UDP_PORT,
        carol,
        UDP_PORT,
        &record(MsgType::DiscoveryResponse, 7, "carol", carol, ""),
    );
    service.tick(&mut drv, &mut sink, 1);
    service.tick(&mut drv, &mut sink, 2);

    assert_eq!(service.peers().active_count(), 1);
    assert!(
        !drv.udp_sent.iter().any(|s| s.dest == carol),
        "a response must not trigger another response"
    );
}

#[test]
fn two_nodes_discover_each_other() {
    // Literal scenario: A broadcasts, B answers, both rosters fill.
    let (mut drv_a, mut svc_a, mut sink_a) = make_node("alice", ip(10));
    let (mut drv_b, mut svc_b, mut sink_b) = make_node("bob", ip(11));

    for now in 0..8 {
        svc_a.tick(&mut drv_a, &mut sink_a, now);
        svc_b.tick(&mut drv_b, &mut sink_b, now);

        // Ferry datagrams between the two mock networks.
        for sent in drv_a.udp_sent.drain(..) {
            if sent.dest.is_broadcast() || sent.dest == ip(11) {
                drv_b.deliver_udp(UDP_PORT, ip(10), UDP_PORT, &sent.bytes);
            }
        }
        for sent in drv_b.udp_sent.drain(..) {
            if sent.dest.is_broadcast() || sent.dest == ip(10) {
                drv_a.deliver_udp(UDP_PORT, ip(11), UDP_PORT, &sent.bytes);
            }
        }
    }

    let a_sees: Vec<_> = svc_a.peers().iter_active().map(|p| p.username.to_string()).collect();
    let b_sees: Vec<_> = svc_b.peers().iter_active().map(|p| p.username.to_string()).collect();
    assert_eq!(a_sees, vec!["bob".to_string()]);
    assert_eq!(b_sees, vec!["alice".to_string()]);
    assert_eq!(sink_a.list_updates(), 1);
    assert_eq!(sink_b.list_updates(), 1);
}

#[test]
fn own_broadcast_is_ignored() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    drv.deliver_udp(
        UDP_PORT,
        ip(10), // ourselves
        UDP_PORT,
        &record(MsgType::Discovery, 3, "alice", ip(10), ""),
    );
    service.tick(&mut drv, &mut sink, 1);
    service.tick(&mut drv, &mut sink, 2);

    assert_eq!(service.peers().active_count(), 0);
    assert!(!drv.udp_sent.iter().any(|s| s.dest == ip(10)));
}

#[test]
fn quit_datagram_greys_peer_out() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    let bob = ip(11);
    drv.deliver_udp(UDP_PORT, bob, UDP_PORT, &record(MsgType::Discovery, 1, "bob", bob, ""));
    service.tick(&mut drv, &mut sink, 1);
    assert_eq!(service.peers().active_count(), 1);

    drv.deliver_udp(UDP_PORT, bob, UDP_PORT, &record(MsgType::Quit, 2, "bob", bob, ""));
    service.tick(&mut drv, &mut sink, 2);
    service.tick(&mut drv, &mut sink, 3);

    assert_eq!(service.peers().active_count(), 0);
    assert!(sink.list_updates() >= 2, "departure refreshes the list");
}

#[test]
fn quiet_peer_is_pruned_after_timeout() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    let bob = ip(11);
    drv.deliver_udp(UDP_PORT, bob, UDP_PORT, &record(MsgType::Discovery, 1, "bob", bob, ""));
    service.tick(&mut drv, &mut sink, 1);
    assert_eq!(service.peers().active_count(), 1);

    // Well past the 1800-tick peer timeout, on a prune boundary.
    service.tick(&mut drv, &mut sink, 1900);
    assert_eq!(service.peers().active_count(), 0);

    let last = sink.events.last().unwrap();
    assert_eq!(*last, AppEvent::PeerListUpdated { active: 0 });
}

#[test]
fn no_receive_until_buffer_return_completes() {
    let (mut drv, mut service, mut sink) = make_node("alice", ip(10));
    service.tick(&mut drv, &mut sink, 0);

    // The next buffer return stays in flight for three polls.
    drv.stall_returns = 3;
    let bob = ip(11);
    drv.deliver_udp(UDP_PORT, bob, UDP_PORT, &record(MsgType::Discovery, 1, "bob", bob, ""));
    service.tick(&mut drv, &mut sink, 1); // receive completes, return starts
    drv.clear_log();

    // While the return is pending, no new receive may start.
    service.tick(&mut drv, &mut sink, 2);
    service.tick(&mut drv, &mut sink, 3);
    assert!(
        drv.log_index("udp_receive_async").is_none(),
        "receive restarted while the buffer was still out"
    );

    // Once the return completes, listening resumes and a second
    // datagram flows.
    service.tick(&mut drv, &mut sink, 4);
    service.tick(&mut drv, &mut sink, 5);
    assert!(drv.log_index("udp_receive_async").is_some());

    let carol = ip(12);
    drv.deliver_udp(
        UDP_PORT,
        carol,
        UDP_PORT,
        &record(MsgType::Discovery, 2, "carol", carol, ""),
    );
    service.tick(&mut drv, &mut sink, 6);
    assert_eq!(service.peers().active_count(), 2);
}
