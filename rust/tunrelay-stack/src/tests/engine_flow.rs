//! The assembled engine over a mock tunnel.

use super::wait_until;
use crate::device::mock::MockDevice;
use crate::device::{DeviceConfig, VirtualDevice};
use crate::engine::Engine;
use crate::error::Result;
use crate::events::{CloseReason, FlowEvent, Protocol};
use crate::hooks::{Direction, HookVerdict, PacketHook};
use crate::link::Link;
use crate::monitor::ThreadState;
use crate::packet::{build_ipv4_tcp, build_ipv4_udp, Packet, TcpFlags};
use crate::queue::RetentionListener;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct CountDownlink(AtomicUsize);

impl PacketHook for CountDownlink {
    fn name(&self) -> &str {
        "count-downlink"
    }

    fn on_packet(&self, _direction: Direction, _packet: &mut Packet) -> Result<HookVerdict> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(HookVerdict::Continue)
    }
}

fn echo_peer() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {}", other),
    };
    (socket, addr)
}

#[test]
fn test_engine_relays_udp_and_shuts_down() {
    let (peer, remote) = echo_peer();
    let client = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 7000);
    let link = Link::new(client.port(), remote);

    let counter = Arc::new(CountDownlink(AtomicUsize::new(0)));
    let engine = Engine::builder()
        .channel_capacity(4)
        .hook(Direction::Downlink, 0, counter.clone())
        .build()
        .unwrap();
    let mut events = engine.subscribe();
    let device = Arc::new(MockDevice::new(DeviceConfig::default()));
    let tunnel: Arc<dyn VirtualDevice> = device.clone();
    engine.start(tunnel.clone()).unwrap();
    assert!(engine.start(tunnel).is_err());

    assert!(wait_until(
        || std::thread::sleep(Duration::from_millis(5)),
        || engine
            .snapshot()
            .threads
            .iter()
            .all(|t| t.state == ThreadState::Running),
    ));

    device.inject_packet(
        build_ipv4_udp(*client.ip(), *remote.ip(), client.port(), remote.port(), b"echo me").to_vec(),
    );
    let mut buf = [0u8; 64];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"echo me");
    peer.send_to(&buf[..n], from).unwrap();

    let written = std::cell::RefCell::new(Vec::new());
    assert!(wait_until(
        || {
            written.borrow_mut().extend(device.get_written_packets());
            std::thread::sleep(Duration::from_millis(5));
        },
        || !written.borrow().is_empty(),
    ));
    let written = written.into_inner();
    let reply = Packet::ipv4(written[0].as_slice().into());
    let ip = reply.ipv4_view().unwrap();
    assert_eq!(ip.src(), *remote.ip());
    assert_eq!(ip.dst(), *client.ip());
    let udp = reply.udp_view().unwrap();
    assert_eq!(udp.dst_port(), client.port());
    assert_eq!(udp.payload(), b"echo me");
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);

    let snapshot = engine.snapshot();
    assert!(snapshot.running);
    assert_eq!(snapshot.udp_channels.size, 1);
    assert_eq!(snapshot.udp_channels.capacity, 4);
    assert_eq!(snapshot.udp_channels.entries[0].link, link);
    assert_eq!(snapshot.tcp_sessions.size, 0);
    assert_eq!(snapshot.stats.udp_packets, 1);
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["udp_channels"]["size"], 1);
    assert_eq!(json["threads"].as_array().unwrap().len(), 5);

    engine.stop();
    assert!(!engine.is_running());
    let snapshot = engine.snapshot();
    assert!(snapshot.threads.iter().all(|t| t.state == ThreadState::Stopped));
    assert_eq!(snapshot.udp_channels.size, 0);
    assert_eq!(snapshot.stats.udp_sessions_active, 0);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            FlowEvent::Opened { link, protocol: Protocol::Udp },
            FlowEvent::Closed { link, protocol: Protocol::Udp, reason: CloseReason::Shutdown },
        ]
    );
}

#[test]
fn test_uplink_hook_can_drop() {
    struct DropAll;
    impl PacketHook for DropAll {
        fn name(&self) -> &str {
            "drop-all"
        }

        fn on_packet(&self, _direction: Direction, _packet: &mut Packet) -> Result<HookVerdict> {
            Ok(HookVerdict::Drop)
        }
    }

    let engine = Engine::builder()
        .hook(Direction::Uplink, 10, Arc::new(DropAll))
        .build()
        .unwrap();
    let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
    engine.inject(Packet::ipv4(build_ipv4_udp(
        Ipv4Addr::new(10, 0, 0, 2),
        *remote.ip(),
        7001,
        remote.port(),
        b"x",
    )));
    let stats = engine.stats().snapshot();
    assert_eq!(stats.packets_dropped, 1);
    assert_eq!(stats.udp_packets, 0);
    assert_eq!(engine.udp().channel_count(), 0);
}

#[derive(Default)]
struct Mirror(AtomicUsize);

impl RetentionListener for Mirror {
    fn on_buffer_retained(&self, data: &[u8]) {
        self.0.fetch_add(data.len(), Ordering::SeqCst);
    }
}

#[test]
fn test_engine_relays_tcp_with_retention_listener() {
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote = match server.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {}", other),
    };
    let client = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 45000);
    let tcp = |seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]| {
        build_ipv4_tcp(*client.ip(), *remote.ip(), client.port(), remote.port(), seq, ack, flags, 65535, payload, None)
            .to_vec()
    };

    let mirror = Arc::new(Mirror::default());
    let engine = Engine::builder().retention_listener(mirror.clone()).build().unwrap();
    let device = Arc::new(MockDevice::new(DeviceConfig::default()));
    engine.start(device.clone()).unwrap();

    device.inject_packet(tcp(100, 0, TcpFlags::syn_only(), &[]));
    let written = std::cell::RefCell::new(Vec::new());
    assert!(wait_until(
        || {
            written.borrow_mut().extend(device.get_written_packets());
            std::thread::sleep(Duration::from_millis(5));
        },
        || !written.borrow().is_empty(),
    ));
    let syn_ack = Packet::ipv4(written.borrow()[0].as_slice().into());
    let view = syn_ack.tcp_view().unwrap();
    assert_eq!(view.flags(), TcpFlags::syn_ack());
    assert_eq!(view.ack(), 101);
    let isn = view.seq();

    let (mut upstream, _) = server.accept().unwrap();
    upstream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    device.inject_packet(tcp(101, isn.wrapping_add(1), TcpFlags::ack_only(), &[]));
    device.inject_packet(tcp(101, isn.wrapping_add(1), TcpFlags::psh_ack(), b"mirrored"));

    let mut got = [0u8; 8];
    upstream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"mirrored");
    assert_eq!(mirror.0.load(Ordering::SeqCst), 8);
    assert_eq!(engine.tcp().session_count(), 1);

    engine.stop();
    assert_eq!(engine.tcp().session_count(), 0);
}
