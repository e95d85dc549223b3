//! Uplink half of the UDP engine.

use super::UdpShared;
use crate::device::PacketSink;
use crate::error::{Result, StackError};
use crate::events::CloseReason;
use crate::link::Link;
use crate::packet::Packet;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub struct UdpTransmitter {
    shared: Arc<UdpShared>,
}

impl UdpTransmitter {
    pub fn new(shared: Arc<UdpShared>) -> Self {
        Self { shared }
    }

    pub fn run(&self, rx: &Receiver<Packet>, running: &AtomicBool) -> Result<()> {
        let timeout = self.shared.config.udp.select_timeout();
        while running.load(Ordering::Relaxed) {
            match rx.recv_timeout(timeout) {
                Ok(packet) => self.handle_uplink(packet),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    /// Send one tunnel datagram upstream. Failures drop the datagram and,
    /// for socket errors, the channel.
    pub fn handle_uplink(&self, packet: Packet) {
        let (Some(ip), Some(udp)) = (packet.ipv4_view(), packet.udp_view()) else {
            trace!("udp: not a UDP/IPv4 packet, dropped");
            self.shared.stats.record_invalid();
            return;
        };
        let client = SocketAddrV4::new(ip.src(), udp.src_port());
        let remote = SocketAddrV4::new(ip.dst(), udp.dst_port());
        let link = Link::new(client.port(), remote);
        if let Err(e) = self.send(link, client, udp.payload()) {
            debug!("udp {}: datagram dropped: {}", link, e);
            self.shared.stats.record_dropped();
        }
    }

    fn send(&self, link: Link, client: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let shared = &self.shared;
        let channel = match shared.channel_for(link, client) {
            Ok(channel) => channel,
            Err(e) => {
                if let StackError::SocketUnprotected(fd) = e {
                    warn!("udp {}: fd={} could not be protected", link, fd);
                    shared.stats.record_protect_failure();
                } else {
                    shared.stats.record_upstream_error();
                }
                return Err(e);
            }
        };

        let mut inner = channel.lock();
        let Some(socket) = inner.socket.as_ref() else {
            return Err(StackError::UdpError("channel closed".into()));
        };

        let mut attempts = 0;
        loop {
            match socket.send(payload) {
                Ok(n) if n == payload.len() => {
                    channel.record_sent();
                    trace!("udp {}: -> {} bytes", link, n);
                    return Ok(());
                }
                Ok(n) => {
                    return Err(StackError::UdpError(format!(
                        "short send: {} of {} bytes",
                        n,
                        payload.len()
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts < shared.config.udp.send_retries => {
                    attempts += 1;
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(StackError::QueueFull("udp socket"));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("udp {}: send failed: {}", link, e);
                    shared.stats.record_upstream_error();
                    shared.finish(&channel, &mut inner, CloseReason::Error);
                    return Err(e.into());
                }
            }
        }
    }
}

impl PacketSink for UdpTransmitter {
    fn deliver(&self, packet: Packet) -> Result<()> {
        self.handle_uplink(packet);
        Ok(())
    }
}
