//! Routes inbound IPv4 packets to the protocol engines.

use crate::device::PacketSink;
use crate::error::Result;
use crate::packet::Packet;
use crate::stats::StackStats;
use smoltcp::wire::IpProtocol;
use std::sync::Arc;
use tracing::{debug, trace};

/// Pure routing on the IPv4 protocol field. Unknown protocols and protocols
/// without a sink are dropped and counted, never reported as errors.
pub struct IpProtocolDispatcher {
    tcp: Option<Arc<dyn PacketSink>>,
    udp: Option<Arc<dyn PacketSink>>,
    icmp: Option<Arc<dyn PacketSink>>,
    stats: Arc<StackStats>,
}

impl IpProtocolDispatcher {
    pub fn new(stats: Arc<StackStats>) -> Self {
        Self {
            tcp: None,
            udp: None,
            icmp: None,
            stats,
        }
    }

    pub fn with_tcp(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.tcp = Some(sink);
        self
    }

    pub fn with_udp(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.udp = Some(sink);
        self
    }

    pub fn with_icmp(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.icmp = Some(sink);
        self
    }

    pub fn dispatch(&self, packet: Packet) {
        let Some(protocol) = packet.ipv4_view().map(|ip| ip.protocol()) else {
            trace!("dropping packet without a valid IPv4 header ({} bytes)", packet.len());
            self.stats.record_invalid();
            return;
        };

        let sink = match IpProtocol::from(protocol) {
            IpProtocol::Tcp => {
                self.stats.record_tcp();
                self.tcp.as_ref()
            }
            IpProtocol::Udp => {
                self.stats.record_udp();
                self.udp.as_ref()
            }
            IpProtocol::Icmp => {
                self.stats.record_icmp();
                self.icmp.as_ref()
            }
            other => {
                self.stats.record_other();
                debug!("dropping packet with unhandled protocol {}", other);
                None
            }
        };

        match sink {
            Some(sink) => {
                if let Err(e) = sink.deliver(packet) {
                    debug!("protocol sink refused packet: {}", e);
                    self.stats.record_dropped();
                }
            }
            None => self.stats.record_dropped(),
        }
    }
}

impl PacketSink for IpProtocolDispatcher {
    fn deliver(&self, packet: Packet) -> Result<()> {
        self.dispatch(packet);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4_tcp, build_ipv4_udp, TcpFlags};
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Collect(Mutex<Vec<usize>>);

    impl PacketSink for Collect {
        fn deliver(&self, packet: Packet) -> Result<()> {
            self.0.lock().push(packet.len());
            Ok(())
        }
    }

    fn udp() -> Packet {
        Packet::ipv4(build_ipv4_udp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(8, 8, 8, 8),
            5000,
            53,
            b"q",
        ))
    }

    #[test]
    fn test_routes_by_protocol() {
        let stats = Arc::new(StackStats::new());
        let tcp = Arc::new(Collect::default());
        let udp_sink = Arc::new(Collect::default());
        let dispatcher = IpProtocolDispatcher::new(stats.clone())
            .with_tcp(tcp.clone())
            .with_udp(udp_sink.clone());

        dispatcher.dispatch(udp());
        dispatcher.dispatch(Packet::ipv4(build_ipv4_tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(1, 1, 1, 1),
            4000,
            80,
            0,
            0,
            TcpFlags::syn_only(),
            1024,
            &[],
            None,
        )));

        assert_eq!(udp_sink.0.lock().len(), 1);
        assert_eq!(tcp.0.lock().len(), 1);
        assert_eq!(stats.snapshot().packets_dropped, 0);
    }

    #[test]
    fn test_unknown_protocol_dropped_silently() {
        let stats = Arc::new(StackStats::new());
        let tcp = Arc::new(Collect::default());
        let udp_sink = Arc::new(Collect::default());
        let icmp = Arc::new(Collect::default());
        let dispatcher = IpProtocolDispatcher::new(stats.clone())
            .with_tcp(tcp.clone())
            .with_udp(udp_sink.clone())
            .with_icmp(icmp.clone());

        let mut buf = udp().into_buffer().unwrap();
        buf[9] = 47; // GRE
        let mut packet = Packet::ipv4(buf);
        // keep the header checksum valid for the new protocol id
        let mut editor = packet.ipv4_editor().unwrap();
        editor.set_ttl(63);
        editor.commit().unwrap();

        assert!(dispatcher.deliver(packet).is_ok());
        assert!(tcp.0.lock().is_empty());
        assert!(udp_sink.0.lock().is_empty());
        assert!(icmp.0.lock().is_empty());
        let snap = stats.snapshot();
        assert_eq!(snap.other_packets, 1);
        assert_eq!(snap.packets_dropped, 1);
    }

    #[test]
    fn test_missing_sink_drops() {
        let stats = Arc::new(StackStats::new());
        let dispatcher = IpProtocolDispatcher::new(stats.clone());
        dispatcher.dispatch(udp());
        assert_eq!(stats.snapshot().packets_dropped, 1);
    }
}
