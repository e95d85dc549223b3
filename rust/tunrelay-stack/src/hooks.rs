//! Packet-level hooks run on the tunnel thread.
//!
//! Hooks are kept per [`Direction`] in descending priority order. A hook
//! registered with the same priority as existing ones runs after them.

use crate::error::Result;
use crate::packet::Packet;
use parking_lot::RwLock;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Tunnel to network, before dispatch.
    Uplink,
    /// Network to tunnel, before the device write.
    Downlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookVerdict {
    Continue,
    Drop,
}

pub trait PacketHook: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect or rewrite `packet`. Returning an error drops the packet.
    fn on_packet(&self, direction: Direction, packet: &mut Packet) -> Result<HookVerdict>;
}

struct HookEntry {
    priority: i32,
    hook: Arc<dyn PacketHook>,
}

#[derive(Default)]
pub struct HookTable {
    uplink: RwLock<Vec<HookEntry>>,
    downlink: RwLock<Vec<HookEntry>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, direction: Direction) -> &RwLock<Vec<HookEntry>> {
        match direction {
            Direction::Uplink => &self.uplink,
            Direction::Downlink => &self.downlink,
        }
    }

    pub fn register(&self, direction: Direction, priority: i32, hook: Arc<dyn PacketHook>) {
        let mut list = self.list(direction).write();
        let at = list
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(list.len());
        debug!("hook {} registered for {:?} at position {}", hook.name(), direction, at);
        list.insert(at, HookEntry { priority, hook });
    }

    pub fn is_empty(&self, direction: Direction) -> bool {
        self.list(direction).read().is_empty()
    }

    /// Hook names in run order.
    pub fn names(&self, direction: Direction) -> Vec<String> {
        self.list(direction)
            .read()
            .iter()
            .map(|e| e.hook.name().to_string())
            .collect()
    }

    /// Run every hook for `direction`. Returns false if the packet should be dropped.
    pub fn run(&self, direction: Direction, packet: &mut Packet) -> bool {
        let list = self.list(direction).read();
        for entry in list.iter() {
            match entry.hook.on_packet(direction, packet) {
                Ok(HookVerdict::Continue) => {}
                Ok(HookVerdict::Drop) => {
                    debug!("hook {} dropped a {:?} packet", entry.hook.name(), direction);
                    return false;
                }
                Err(e) => {
                    warn!("hook {} failed: {}", entry.hook.name(), e);
                    return false;
                }
            }
        }
        true
    }
}

/// Rewrites one destination to another, and the replies back.
pub struct RedirectHook {
    original: SocketAddrV4,
    target: SocketAddrV4,
}

impl RedirectHook {
    pub fn new(original: SocketAddrV4, target: SocketAddrV4) -> Self {
        Self { original, target }
    }
}

fn endpoints(packet: &Packet) -> Option<(SocketAddrV4, SocketAddrV4)> {
    let ip = packet.ipv4_view()?;
    let (sport, dport) = if let Some(tcp) = packet.tcp_view() {
        (tcp.src_port(), tcp.dst_port())
    } else {
        let udp = packet.udp_view()?;
        (udp.src_port(), udp.dst_port())
    };
    Some((SocketAddrV4::new(ip.src(), sport), SocketAddrV4::new(ip.dst(), dport)))
}

fn rewrite(packet: &mut Packet, addr: SocketAddrV4, source: bool) -> Result<()> {
    if packet.tcp_view().is_some() {
        let mut tcp = packet.tcp_editor()?;
        if source { tcp.set_src_port(addr.port()); } else { tcp.set_dst_port(addr.port()); }
        tcp.commit()?;
    } else {
        let mut udp = packet.udp_editor()?;
        if source { udp.set_src_port(addr.port()); } else { udp.set_dst_port(addr.port()); }
        udp.commit()?;
    }
    let mut ip = packet.ipv4_editor()?;
    if source { ip.set_src(*addr.ip()); } else { ip.set_dst(*addr.ip()); }
    ip.commit()?;
    Ok(())
}

impl PacketHook for RedirectHook {
    fn name(&self) -> &str {
        "redirect"
    }

    fn on_packet(&self, direction: Direction, packet: &mut Packet) -> Result<HookVerdict> {
        let Some((src, dst)) = endpoints(packet) else {
            return Ok(HookVerdict::Continue);
        };
        match direction {
            Direction::Uplink if dst == self.original => rewrite(packet, self.target, false)?,
            Direction::Downlink if src == self.target => rewrite(packet, self.original, true)?,
            _ => {}
        }
        Ok(HookVerdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_ipv4_tcp, build_ipv4_udp, TcpFlags};
    use smoltcp::wire::{IpAddress, Ipv4Packet, TcpPacket};
    use std::net::Ipv4Addr;

    struct Named(&'static str, HookVerdict);

    impl PacketHook for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn on_packet(&self, _: Direction, _: &mut Packet) -> Result<HookVerdict> {
            Ok(self.1)
        }
    }

    fn named(name: &'static str) -> Arc<dyn PacketHook> {
        Arc::new(Named(name, HookVerdict::Continue))
    }

    #[test]
    fn test_priority_order_and_tie_break() {
        let table = HookTable::new();
        table.register(Direction::Uplink, 0, named("low"));
        table.register(Direction::Uplink, 10, named("high-first"));
        table.register(Direction::Uplink, 10, named("high-second"));
        table.register(Direction::Uplink, 5, named("mid"));
        assert_eq!(
            table.names(Direction::Uplink),
            vec!["high-first", "high-second", "mid", "low"]
        );
        assert!(table.is_empty(Direction::Downlink));
    }

    #[test]
    fn test_drop_stops_chain() {
        let table = HookTable::new();
        table.register(Direction::Downlink, 1, Arc::new(Named("drop", HookVerdict::Drop)));
        let mut packet = Packet::ipv4(build_ipv4_udp(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            53,
            5000,
            b"x",
        ));
        assert!(!table.run(Direction::Downlink, &mut packet));
        assert!(table.run(Direction::Uplink, &mut packet));
    }

    #[test]
    fn test_redirect_rewrites_both_directions() {
        let original = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 5), 80);
        let target = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080);
        let hook = RedirectHook::new(original, target);
        let client = Ipv4Addr::new(10, 0, 0, 2);

        let mut up = Packet::ipv4(build_ipv4_tcp(
            client, *original.ip(), 40000, 80, 1, 0, TcpFlags::syn_only(), 65535, &[], Some(1400),
        ));
        hook.on_packet(Direction::Uplink, &mut up).unwrap();
        let (_, dst) = endpoints(&up).unwrap();
        assert_eq!(dst, target);
        let ip = Ipv4Packet::new_checked(up.buffer()).unwrap();
        assert!(ip.verify_checksum());
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.verify_checksum(&IpAddress::Ipv4(ip.src_addr()), &IpAddress::Ipv4(ip.dst_addr())));

        let mut down = Packet::ipv4(build_ipv4_tcp(
            *target.ip(), client, 8080, 40000, 9, 2, TcpFlags::syn_ack(), 65535, &[], Some(1400),
        ));
        hook.on_packet(Direction::Downlink, &mut down).unwrap();
        let (src, _) = endpoints(&down).unwrap();
        assert_eq!(src, original);
    }
}
