//! UDP engine against a loopback peer.

use super::{wait_until, Collect};
use crate::config::EngineConfig;
use crate::events::{CloseReason, EventBus, FlowEvent, Protocol};
use crate::link::Link;
use crate::packet::{build_ipv4_udp, Packet};
use crate::protect::{CallbackProtector, NoopProtector, SocketProtector};
use crate::selector::Selector;
use crate::stats::StackStats;
use crate::udp::{UdpReceiver, UdpShared, UdpTransmitter};
use smoltcp::wire::{IpAddress, Ipv4Packet, UdpPacket};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

struct Harness {
    shared: Arc<UdpShared>,
    transmitter: UdpTransmitter,
    receiver: UdpReceiver,
    downlink: Arc<Collect>,
    events: broadcast::Receiver<FlowEvent>,
    stats: Arc<StackStats>,
}

impl Harness {
    fn new(capacity: usize, protector: Arc<dyn SocketProtector>) -> Self {
        let mut config = EngineConfig::default();
        config.udp.channel_capacity = capacity;
        let selector = Selector::new().unwrap();
        let downlink = Arc::new(Collect::default());
        let events = EventBus::new(64);
        let subscriber = events.subscribe();
        let stats = Arc::new(StackStats::new());
        let shared = Arc::new(UdpShared::new(
            config,
            selector.handle(),
            downlink.clone(),
            protector,
            events,
            stats.clone(),
        ));
        Self {
            transmitter: UdpTransmitter::new(shared.clone()),
            receiver: UdpReceiver::new(shared.clone(), selector),
            shared,
            downlink,
            events: subscriber,
            stats,
        }
    }

    fn send(&self, client_port: u16, remote: SocketAddrV4, payload: &[u8]) {
        let packet = build_ipv4_udp(CLIENT_IP, *remote.ip(), client_port, remote.port(), payload);
        self.transmitter.handle_uplink(Packet::ipv4(packet));
    }

    fn events(&mut self) -> Vec<FlowEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn peer() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {}", other),
    };
    (socket, addr)
}

#[test]
fn test_datagrams_share_one_channel() {
    let (server, remote) = peer();
    let mut h = Harness::new(8, Arc::new(NoopProtector));
    let link = Link::new(5000, remote);

    h.send(5000, remote, b"ping");
    h.send(5000, remote, b"pong");
    assert_eq!(h.shared.channel_count(), 1);

    let mut buf = [0u8; 64];
    let (n, from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    let (n, again) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, again);

    let channel = h.shared.channel(&link).unwrap();
    assert_eq!(channel.counters(), (2, 0));
    assert_eq!(h.stats.snapshot().udp_sessions_total, 1);
    assert_eq!(h.events(), vec![FlowEvent::Opened { link, protocol: Protocol::Udp }]);
}

#[test]
fn test_reply_is_synthesized() {
    let (server, remote) = peer();
    let mut h = Harness::new(8, Arc::new(NoopProtector));

    h.send(5001, remote, b"question");
    let mut buf = [0u8; 64];
    let (_, from) = server.recv_from(&mut buf).unwrap();
    server.send_to(b"answer", from).unwrap();

    let downlink = h.downlink.clone();
    let receiver = &mut h.receiver;
    assert!(wait_until(
        || {
            receiver.poll_once(Some(Duration::from_millis(10))).unwrap();
        },
        || downlink.len() > 0,
    ));

    let packets = h.downlink.take();
    assert_eq!(packets.len(), 1);
    let reply = &packets[0];
    let ip = reply.ipv4_view().unwrap();
    assert_eq!(ip.src(), *remote.ip());
    assert_eq!(ip.dst(), CLIENT_IP);
    let udp = reply.udp_view().unwrap();
    assert_eq!(udp.src_port(), remote.port());
    assert_eq!(udp.dst_port(), 5001);
    assert_eq!(udp.payload(), b"answer");

    let wire = Ipv4Packet::new_checked(reply.buffer()).unwrap();
    assert!(wire.verify_checksum());
    let datagram = UdpPacket::new_checked(wire.payload()).unwrap();
    assert!(datagram.verify_checksum(&IpAddress::Ipv4(wire.src_addr()), &IpAddress::Ipv4(wire.dst_addr())));

    let channel = h.shared.channel(&Link::new(5001, remote)).unwrap();
    assert_eq!(channel.counters(), (1, 1));
}

#[test]
fn test_refused_port_closes_channel() {
    let (server, remote) = peer();
    drop(server);
    let mut h = Harness::new(8, Arc::new(NoopProtector));
    let link = Link::new(5002, remote);

    h.send(5002, remote, b"anyone?");
    let shared = h.shared.clone();
    let receiver = &mut h.receiver;
    assert!(wait_until(
        || {
            receiver.poll_once(Some(Duration::from_millis(10))).unwrap();
        },
        || shared.channel_count() == 0,
    ));
    assert!(h.events().contains(&FlowEvent::Closed {
        link,
        protocol: Protocol::Udp,
        reason: CloseReason::Error,
    }));
    assert_eq!(h.stats.snapshot().udp_sessions_active, 0);
}

#[test]
fn test_full_cache_evicts_oldest() {
    let (_server, remote) = peer();
    let mut h = Harness::new(1, Arc::new(NoopProtector));
    let first = Link::new(6000, remote);

    h.send(6000, remote, b"a");
    let old = h.shared.channel(&first).unwrap();
    h.send(6001, remote, b"b");

    assert_eq!(h.shared.channel_count(), 1);
    assert!(h.shared.channel(&first).is_none());
    assert!(!old.is_open());
    assert!(h.events().contains(&FlowEvent::Closed {
        link: first,
        protocol: Protocol::Udp,
        reason: CloseReason::Evicted,
    }));
    assert_eq!(h.stats.snapshot().evictions, 1);
}

#[test]
fn test_unprotected_socket_drops_datagram() {
    let (_server, remote) = peer();
    let h = Harness::new(8, Arc::new(CallbackProtector::new(|_| false)));

    h.send(6100, remote, b"x");
    assert_eq!(h.shared.channel_count(), 0);
    let stats = h.stats.snapshot();
    assert_eq!(stats.protect_failures, 1);
    assert_eq!(stats.packets_dropped, 1);
}

#[test]
fn test_oversize_reply_is_dropped() {
    let (server, remote) = peer();
    let mut h = Harness::new(8, Arc::new(NoopProtector));
    let limit = EngineConfig::default().max_datagram();

    h.send(5003, remote, b"big?");
    let mut buf = [0u8; 64];
    let (_, from) = server.recv_from(&mut buf).unwrap();
    server.send_to(&[0xab; 3000], from).unwrap();
    server.send_to(&vec![0xcd; limit], from).unwrap();

    let downlink = h.downlink.clone();
    let receiver = &mut h.receiver;
    assert!(wait_until(
        || {
            receiver.poll_once(Some(Duration::from_millis(10))).unwrap();
        },
        || downlink.len() > 0,
    ));

    let packets = h.downlink.take();
    assert_eq!(packets.len(), 1);
    let udp = packets[0].udp_view().unwrap();
    assert_eq!(udp.payload().len(), limit);
    assert!(udp.payload().iter().all(|&b| b == 0xcd));
    assert_eq!(packets[0].len(), 1500);

    let stats = h.stats.snapshot();
    assert_eq!(stats.packets_dropped, 1);
    let channel = h.shared.channel(&Link::new(5003, remote)).unwrap();
    assert_eq!(channel.counters(), (1, 1));
    assert!(channel.is_open());
}
