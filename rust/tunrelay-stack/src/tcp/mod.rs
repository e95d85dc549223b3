//! TCP flow engine.
//!
//! The relay terminates the tunnel side of every TCP flow itself and
//! carries the byte stream over a real upstream socket. Two threads share
//! the state in [`TcpShared`]:
//!
//! * the [`TcpTransmitter`] consumes uplink segments from the tunnel,
//!   drives the handshake and the close sequence, and writes payload
//!   upstream through each flow's [`DataTransferQueue`](crate::queue::DataTransferQueue);
//! * the [`TcpReceiver`] runs the selector over all upstream sockets,
//!   finishes connects and turns upstream reads into downlink segments.
//!
//! Every segment that touches a flow is handled under that flow's lock.

pub mod connection;
pub mod receiver;
pub mod tcb;
pub mod transmitter;
pub mod upstream;

pub use connection::{Connection, ConnectionInner};
pub use receiver::TcpReceiver;
pub use tcb::{seq_after, seq_before, Acceptance, Tcb, TcpState};
pub use transmitter::TcpTransmitter;
pub use upstream::UpstreamCommand;

use crate::config::EngineConfig;
use crate::device::PacketSink;
use crate::error::Result;
use crate::events::{CloseReason, EventBus, Protocol};
use crate::link::Link;
use crate::packet::{
    build_ipv4_tcp, mss_option, next_ip_id, Packet, PacketBuilder, PayloadMode, TcpFlags,
};
use crate::protect::SocketProtector;
use crate::queue::RetentionListener;
use crate::registry::SessionRegistry;
use crate::selector::SelectorHandle;
use crate::stats::StackStats;
use dashmap::DashMap;
use mio::Token;
use serde::Serialize;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::{debug, trace};

/// Header fields of one uplink segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub client: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload_len: usize,
    /// Sequence space used: payload plus one each for SYN and FIN.
    pub seq_len: u32,
    pub mss: Option<u16>,
}

impl Segment {
    pub fn parse(packet: &Packet) -> Option<Self> {
        let ip = packet.ipv4_view()?;
        let tcp = packet.tcp_view()?;
        Some(Self {
            client: SocketAddrV4::new(ip.src(), tcp.src_port()),
            remote: SocketAddrV4::new(ip.dst(), tcp.dst_port()),
            seq: tcp.seq(),
            ack: tcp.ack(),
            flags: tcp.flags(),
            payload_len: tcp.payload().len(),
            seq_len: tcp.seq_len(),
            mss: tcp.mss(),
        })
    }

    pub fn link(&self) -> Link {
        Link::new(self.client.port(), self.remote)
    }
}

/// One row of the session table, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub link: Link,
    pub state: TcpState,
    pub upstream_backlog: usize,
    pub queued: usize,
}

/// State shared by the transmitter and receiver threads.
pub struct TcpShared {
    pub(crate) config: EngineConfig,
    pub(crate) sessions: SessionRegistry<Arc<Connection>>,
    pub(crate) tokens: DashMap<Token, Arc<Connection>>,
    pub(crate) selector: Arc<SelectorHandle>,
    pub(crate) downlink: Arc<dyn PacketSink>,
    pub(crate) protector: Arc<dyn SocketProtector>,
    pub(crate) events: EventBus,
    pub(crate) stats: Arc<StackStats>,
    pub(crate) listeners: Vec<Arc<dyn RetentionListener>>,
}

impl TcpShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        selector: Arc<SelectorHandle>,
        downlink: Arc<dyn PacketSink>,
        protector: Arc<dyn SocketProtector>,
        events: EventBus,
        stats: Arc<StackStats>,
        listeners: Vec<Arc<dyn RetentionListener>>,
    ) -> Self {
        let sessions = SessionRegistry::new("tcp-sessions", config.tcp.session_capacity);
        Self {
            config,
            sessions,
            tokens: DashMap::new(),
            selector,
            downlink,
            protector,
            events,
            stats,
            listeners,
        }
    }

    pub fn session(&self, link: &Link) -> Option<Arc<Connection>> {
        self.sessions.peek(link)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn capacity(&self) -> usize {
        self.sessions.capacity()
    }

    /// Sessions from most to least recently used.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .entries()
            .into_iter()
            .map(|(link, conn)| {
                let inner = conn.lock();
                SessionInfo {
                    link,
                    state: inner.tcb.state,
                    upstream_backlog: inner.upstream.receiver().backlog_len(),
                    queued: inner.upstream.depth(),
                }
            })
            .collect()
    }

    fn mss(&self) -> u16 {
        self.config.tcp.mss
    }

    /// Largest payload read from upstream into one downlink segment.
    pub(crate) fn read_limit(&self) -> usize {
        self.config.max_segment().min(self.mss() as usize)
    }

    pub(crate) fn send(&self, packet: Packet) {
        if let Err(e) = self.downlink.deliver(packet) {
            debug!("tcp: downlink dropped a segment: {}", e);
            self.stats.record_dropped();
        }
    }

    /// Stamp a header-only segment from the flow's template.
    pub(crate) fn stamp(&self, inner: &ConnectionInner, flags: TcpFlags) -> Result<Packet> {
        let mut packet = inner.template.duplicate();
        stamp_headers(&mut packet, inner, flags)?;
        Ok(packet)
    }

    pub(crate) fn reply(&self, inner: &ConnectionInner, flags: TcpFlags) -> Result<()> {
        let packet = self.stamp(inner, flags)?;
        trace!("tcp: -> {} seq={} ack={}", flags, inner.tcb.local_seq, inner.tcb.local_ack);
        self.send(packet);
        Ok(())
    }

    /// Answer the stashed SYN and switch the flow to `SYN_RECEIVED`.
    pub(crate) fn send_syn_ack(&self, conn: &Connection, inner: &mut ConnectionInner) -> Result<()> {
        let client = conn.client();
        let remote = conn.link().remote();
        let mss = inner.client_mss.unwrap_or(self.mss()).min(self.mss());

        let mut reply = inner.template.duplicate();
        {
            let mut payload = reply.payload_editor(PayloadMode::InPlace)?;
            payload.resize(0)?;
            payload.commit()?;
        }
        {
            let mut tcp = reply.tcp_editor()?;
            tcp.set_src_port(remote.port())
                .set_dst_port(client.port())
                .set_seq(inner.tcb.local_seq)
                .set_ack(inner.tcb.local_ack)
                .set_flags(TcpFlags::syn_ack())
                .set_window(self.config.tcp.window)
                .set_urgent(0);
            tcp.set_options(&mss_option(mss))?;
            tcp.commit()?;
        }
        {
            let mut ip = reply.ipv4_editor()?;
            ip.set_src(*remote.ip())
                .set_dst(*client.ip())
                .set_identification(next_ip_id())
                .set_ttl(64);
            ip.set_options(&[])?;
            ip.commit()?;
        }
        self.send(reply);
        debug!("tcp {}: SYN,ACK isn={} ack={}", conn.link(), inner.tcb.local_seq, inner.tcb.local_ack);

        inner.tcb.advance_seq(1);
        inner.tcb.state = TcpState::SynReceived;
        inner.template = PacketBuilder::tcp_template(
            remote,
            client,
            self.config.tcp.window,
            self.config.mtu,
        );
        Ok(())
    }

    /// Reset the client side of a flow.
    pub(crate) fn send_reset(&self, conn: &Connection, inner: &ConnectionInner) {
        let packet = if inner.tcb.state == TcpState::SynSent {
            // template is still the client's SYN
            let remote = conn.link().remote();
            let client = conn.client();
            Ok(Packet::ipv4(build_ipv4_tcp(
                *remote.ip(),
                *client.ip(),
                remote.port(),
                client.port(),
                0,
                inner.tcb.local_ack,
                TcpFlags::rst_ack(),
                0,
                &[],
                None,
            )))
        } else {
            self.stamp(inner, TcpFlags::rst_ack())
        };
        match packet {
            Ok(packet) => {
                self.stats.record_reset();
                self.send(packet);
            }
            Err(e) => debug!("tcp {}: could not build RST: {}", conn.link(), e),
        }
    }

    /// Reset a segment that belongs to no session.
    pub(crate) fn reset_stray(&self, seg: &Segment) {
        if seg.flags.rst {
            return;
        }
        let (seq, ack, flags) = if seg.flags.ack {
            (seg.ack, 0, TcpFlags::rst_only())
        } else {
            (0, seg.seq.wrapping_add(seg.seq_len), TcpFlags::rst_ack())
        };
        let packet = build_ipv4_tcp(
            *seg.remote.ip(),
            *seg.client.ip(),
            seg.remote.port(),
            seg.client.port(),
            seq,
            ack,
            flags,
            0,
            &[],
            None,
        );
        trace!("tcp {}: stray segment {}, answering {}", seg.link(), seg.flags, flags);
        self.stats.record_reset();
        self.send(Packet::ipv4(packet));
    }

    /// Close the flow and drop it from every index.
    pub(crate) fn finish(&self, conn: &Arc<Connection>, inner: &mut ConnectionInner, reason: CloseReason) {
        conn.close_socket(inner);
        let link = conn.link();
        self.sessions.remove_if(&link, |v| Arc::ptr_eq(v, conn));
        self.forget(conn, reason);
    }

    /// Account for a flow whose socket is already closed.
    pub(crate) fn forget(&self, conn: &Arc<Connection>, reason: CloseReason) {
        self.tokens.remove_if(&conn.token(), |_, v| Arc::ptr_eq(v, conn));
        if conn.mark_reported() {
            debug!("tcp {}: closed ({:?})", conn.link(), reason);
            if reason == CloseReason::Evicted {
                self.stats.record_eviction();
            }
            self.stats.record_tcp_closed();
            self.events.closed(conn.link(), Protocol::Tcp, reason);
        }
    }

    /// Force-close every session. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let drained = self.sessions.close_all();
        for (_, conn) in &drained {
            self.forget(conn, CloseReason::Shutdown);
        }
        drained.len()
    }
}

/// The side of a flow that finished sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Finished {
    Client,
    Upstream,
}

/// Record that one side finished and advance the close sequence.
///
/// The matching command goes onto the flow's queue, behind any data still
/// waiting for the upstream socket. Returns the flags the client must be
/// sent, if any; a FIN in them has not been counted in `local_seq` yet.
pub(crate) fn half_close(inner: &mut ConnectionInner, side: Finished) -> Result<Option<TcpFlags>> {
    match side {
        Finished::Client => {
            inner.upstream.put_command(UpstreamCommand::HalfClose)?;
            if inner.upstream_eof {
                inner.tcb.state = TcpState::LastAck;
                Ok(Some(TcpFlags::fin_ack()))
            } else {
                inner.tcb.state = TcpState::CloseWait;
                Ok(Some(TcpFlags::ack_only()))
            }
        }
        Finished::Upstream => {
            inner.upstream_eof = true;
            inner.upstream.put_command(UpstreamCommand::ReadClosed)?;
            if inner.tcb.state == TcpState::CloseWait {
                inner.tcb.state = TcpState::LastAck;
                Ok(Some(TcpFlags::fin_ack()))
            } else {
                Ok(None)
            }
        }
    }
}

/// Write sequence, ack and flags into a packet built from a flow template.
pub(crate) fn stamp_headers(packet: &mut Packet, inner: &ConnectionInner, flags: TcpFlags) -> Result<()> {
    {
        let mut tcp = packet.tcp_editor()?;
        tcp.set_seq(inner.tcb.local_seq)
            .set_ack(inner.tcb.local_ack)
            .set_flags(flags);
        tcp.commit()?;
    }
    let mut ip = packet.ipv4_editor()?;
    ip.set_identification(next_ip_id());
    ip.commit()?;
    Ok(())
}
