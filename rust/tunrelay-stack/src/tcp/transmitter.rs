//! Uplink half of the TCP engine: tunnel segments in, upstream writes out.

use super::connection::{Connection, ConnectionInner};
use super::tcb::{Acceptance, Tcb, TcpState};
use super::upstream;
use super::{half_close, Finished, Segment, TcpShared};
use crate::device::PacketSink;
use crate::error::{Result, StackError};
use crate::events::{CloseReason, Protocol};
use crate::packet::{LayerKind, Packet, TcpFlags};
use crate::queue::{Attachments, Delivery};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub struct TcpTransmitter {
    shared: Arc<TcpShared>,
}

impl TcpTransmitter {
    pub fn new(shared: Arc<TcpShared>) -> Self {
        Self { shared }
    }

    /// Consume uplink segments until `running` is cleared or the queue closes.
    pub fn run(&self, rx: &Receiver<Packet>, running: &AtomicBool) -> Result<()> {
        let timeout = self.shared.config.tcp.select_timeout();
        while running.load(Ordering::Relaxed) {
            match rx.recv_timeout(timeout) {
                Ok(packet) => self.handle_uplink(packet),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    /// Handle one segment from the tunnel. Failures only ever affect the
    /// segment's own flow.
    pub fn handle_uplink(&self, packet: Packet) {
        let Some(seg) = Segment::parse(&packet) else {
            trace!("tcp: not a TCP/IPv4 packet, dropped");
            self.shared.stats.record_invalid();
            return;
        };
        trace!(
            "tcp {}: <- {} seq={} ack={} len={}",
            seg.link(),
            seg.flags,
            seg.seq,
            seg.ack,
            seg.payload_len
        );
        let result = match self.shared.sessions.get(&seg.link()) {
            Some(conn) => self.on_segment(&conn, &seg, packet),
            None => self.on_new(&seg, packet),
        };
        if let Err(e) = result {
            debug!("tcp {}: segment failed: {}", seg.link(), e);
        }
    }

    fn on_new(&self, seg: &Segment, packet: Packet) -> Result<()> {
        if seg.flags.rst {
            return Ok(());
        }
        if !seg.flags.syn || seg.flags.ack {
            self.shared.reset_stray(seg);
            return Ok(());
        }
        self.open(seg, packet)
    }

    fn open(&self, seg: &Segment, syn: Packet) -> Result<()> {
        let shared = &self.shared;
        let link = seg.link();
        let dialed = match upstream::connect(seg.remote, shared.protector.as_ref()) {
            Ok(dialed) => dialed,
            Err(StackError::SocketUnprotected(fd)) => {
                warn!("tcp {}: fd={} could not be protected, refusing flow", link, fd);
                shared.stats.record_protect_failure();
                shared.reset_stray(seg);
                return Ok(());
            }
            Err(e) => {
                debug!("tcp {}: upstream connect failed: {}", link, e);
                shared.stats.record_upstream_error();
                shared.reset_stray(seg);
                return Ok(());
            }
        };

        let isn: u32 = rand::random();
        let token = shared.selector.next_token();
        let conn = Arc::new(Connection::new(
            link,
            token,
            seg.client,
            shared.selector.clone(),
            Tcb::new(isn, seg.seq),
            dialed.stream,
            shared.listeners.clone(),
            syn,
            seg.mss,
        ));

        shared.tokens.insert(token, conn.clone());
        if let Some((evicted, old)) = shared.sessions.insert(link, conn.clone()) {
            debug!("tcp: session table full, evicted {}", evicted);
            shared.forget(&old, CloseReason::Evicted);
        }
        shared.stats.record_tcp_connection();
        shared.events.opened(link, Protocol::Tcp);
        info!("tcp {}: new flow (connected={})", link, dialed.connected);

        let mut inner = conn.lock();
        let result = if dialed.connected {
            shared
                .send_syn_ack(&conn, &mut inner)
                .and_then(|_| conn.update_interest(&mut inner).map_err(Into::into))
        } else {
            conn.update_interest(&mut inner).map_err(Into::into)
        };
        if let Err(e) = result {
            shared.stats.record_upstream_error();
            shared.send_reset(&conn, &inner);
            shared.finish(&conn, &mut inner, CloseReason::Error);
            return Err(e);
        }
        Ok(())
    }

    fn on_segment(&self, conn: &Arc<Connection>, seg: &Segment, packet: Packet) -> Result<()> {
        let shared = &self.shared;
        let mut inner = conn.lock();
        if inner.closed {
            return Ok(());
        }
        inner.tcb.observe(seg.seq, seg.ack);

        if seg.flags.rst {
            debug!("tcp {}: reset by client in {}", conn.link(), inner.tcb.state);
            shared.finish(conn, &mut inner, CloseReason::Reset);
            return Ok(());
        }

        if seg.flags.syn {
            if inner.tcb.state == TcpState::SynSent {
                // retransmitted SYN while the upstream connect is pending
                inner.tcb.local_ack = seg.seq.wrapping_add(1);
                return Ok(());
            }
            return self.violation(conn, &mut inner, "SYN on a synchronized flow");
        }

        if !seg.flags.ack {
            return Ok(());
        }

        match inner.tcb.state {
            TcpState::SynSent => {
                return self.violation(conn, &mut inner, "ACK before SYN,ACK");
            }
            TcpState::SynReceived => {
                if seg.ack != inner.tcb.local_seq {
                    return self.violation(conn, &mut inner, "bad handshake ACK");
                }
                inner.tcb.state = TcpState::Established;
                debug!("tcp {}: established", conn.link());
                conn.update_interest(&mut inner)?;
            }
            TcpState::LastAck => {
                if seg.ack == inner.tcb.local_seq {
                    shared.finish(conn, &mut inner, CloseReason::Finished);
                }
                return Ok(());
            }
            _ => {}
        }

        let mut reply = None;
        if seg.payload_len > 0 {
            reply = Some(TcpFlags::ack_only());
            if inner.tcb.state == TcpState::Established {
                if let Err(e) = self.forward(conn, &mut inner, seg, packet) {
                    debug!("tcp {}: upstream write failed: {}", conn.link(), e);
                    shared.stats.record_upstream_error();
                    shared.send_reset(conn, &inner);
                    shared.finish(conn, &mut inner, CloseReason::Error);
                    return Ok(());
                }
            }
        }

        if seg.flags.fin {
            reply = Some(self.on_fin(conn, &mut inner, seg)?);
        }

        if let Some(flags) = reply {
            shared.reply(&inner, flags)?;
            if flags.fin {
                inner.tcb.advance_seq(1);
            }
        }
        Ok(())
    }

    /// Push the new part of the segment's payload upstream.
    fn forward(
        &self,
        conn: &Connection,
        inner: &mut ConnectionInner,
        seg: &Segment,
        packet: Packet,
    ) -> Result<()> {
        let skip = match inner.tcb.accept(seg.seq, seg.payload_len) {
            Acceptance::InOrder => 0,
            Acceptance::Partial { skip } => skip,
            Acceptance::Duplicate => {
                trace!("tcp {}: retransmission seq={}", conn.link(), seg.seq);
                return Ok(());
            }
            Acceptance::Future => {
                trace!(
                    "tcp {}: out of order seq={} expected={}",
                    conn.link(),
                    seg.seq,
                    inner.tcb.local_ack
                );
                return Ok(());
            }
        };

        let buffered = inner.upstream_buffered();
        let len = seg.payload_len - skip;
        if buffered > 0 && buffered + len > self.shared.config.tcp.upstream_buffer {
            // left unacknowledged; the client retransmits once upstream drains
            trace!("tcp {}: upstream holds {} bytes, dropping {}", conn.link(), buffered, len);
            self.shared.stats.record_dropped();
            return Ok(());
        }

        let layer = packet
            .layer(LayerKind::Tcp)
            .ok_or(StackError::MissingLayer("tcp"))?;
        let mut buf = packet.into_buffer()?;
        buf.truncate(layer.end());
        let data = buf.split_off(layer.payload_offset() + skip);

        if let Delivery::Retained(_) = inner.upstream.put_data(data, Attachments::new())? {
            trace!("tcp {}: {} bytes retained", conn.link(), len);
        }
        inner.tcb.advance_ack(len);
        conn.update_interest(inner)?;
        Ok(())
    }

    fn on_fin(&self, conn: &Connection, inner: &mut ConnectionInner, seg: &Segment) -> Result<TcpFlags> {
        let fin_seq = seg.seq.wrapping_add(seg.payload_len as u32);
        if inner.tcb.state != TcpState::Established || fin_seq != inner.tcb.local_ack {
            // retransmitted or early FIN
            return Ok(TcpFlags::ack_only());
        }
        inner.tcb.advance_ack(1);
        let flags = half_close(inner, Finished::Client)?.unwrap_or_else(TcpFlags::ack_only);
        debug!("tcp {}: client FIN, now {}", conn.link(), inner.tcb.state);
        conn.update_interest(inner)?;
        Ok(flags)
    }

    fn violation(&self, conn: &Arc<Connection>, inner: &mut ConnectionInner, what: &str) -> Result<()> {
        debug!("tcp {}: {} in {}, resetting", conn.link(), what, inner.tcb.state);
        self.shared.send_reset(conn, inner);
        self.shared.finish(conn, inner, CloseReason::Reset);
        Ok(())
    }
}

impl PacketSink for TcpTransmitter {
    fn deliver(&self, packet: Packet) -> Result<()> {
        self.handle_uplink(packet);
        Ok(())
    }
}
