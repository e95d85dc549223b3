//! Downlink half of the TCP engine: upstream readiness in, tunnel segments out.

use super::connection::{Connection, ConnectionInner};
use super::tcb::TcpState;
use super::upstream::finish_connect;
use super::{half_close, stamp_headers, Finished, TcpShared};
use crate::error::Result;
use crate::events::CloseReason;
use crate::packet::{PayloadMode, TcpFlags};
use crate::selector::{Selector, WAKE_TOKEN};
use mio::Events;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 256;

pub struct TcpReceiver {
    shared: Arc<TcpShared>,
    selector: Selector,
    events: Events,
}

impl TcpReceiver {
    /// `selector` must be the one whose handle `shared` registers with.
    pub fn new(shared: Arc<TcpShared>, selector: Selector) -> Self {
        Self {
            shared,
            selector,
            events: Events::with_capacity(EVENT_CAPACITY),
        }
    }

    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        let timeout = self.shared.config.tcp.select_timeout();
        while running.load(Ordering::Relaxed) {
            self.poll_once(Some(timeout))?;
        }
        Ok(())
    }

    /// Wait for readiness once and service every ready flow. Returns the
    /// number of flow events handled.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.selector.select(&mut self.events, timeout)?;
        let mut handled = 0;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let conn = self
                .shared
                .tokens
                .get(&event.token())
                .map(|entry| entry.value().clone());
            let Some(conn) = conn else {
                trace!("tcp: event for unknown token {}", event.token().0);
                continue;
            };
            let writable = event.is_writable() || event.is_error();
            let readable = event.is_readable() || event.is_read_closed();
            on_ready(&self.shared, &conn, readable, writable);
            handled += 1;
        }
        Ok(handled)
    }
}

fn on_ready(shared: &TcpShared, conn: &Arc<Connection>, readable: bool, writable: bool) {
    let mut inner = conn.lock();
    if inner.closed {
        return;
    }

    if inner.tcb.state == TcpState::SynSent {
        if writable {
            on_connect_ready(shared, conn, &mut inner);
        }
        return;
    }

    let result = (|| -> Result<()> {
        if writable {
            inner.upstream.receiver_mut().drain()?;
            inner.upstream.flush()?;
        }
        if readable && inner.tcb.is_open() && !inner.upstream_eof {
            read_upstream(shared, conn, &mut inner)?;
        }
        conn.update_interest(&mut inner)?;
        Ok(())
    })();

    if let Err(e) = result {
        debug!("tcp {}: upstream failed in {}: {}", conn.link(), inner.tcb.state, e);
        shared.stats.record_upstream_error();
        shared.send_reset(conn, &inner);
        shared.finish(conn, &mut inner, CloseReason::Error);
    }
}

fn on_connect_ready(shared: &TcpShared, conn: &Arc<Connection>, inner: &mut ConnectionInner) {
    let status = match inner.upstream.receiver().stream() {
        Some(stream) => finish_connect(stream),
        None => Err(io::Error::from(io::ErrorKind::NotConnected)),
    };
    let result = match status {
        Ok(false) => return,
        Ok(true) => shared
            .send_syn_ack(conn, inner)
            .and_then(|_| conn.update_interest(inner).map_err(Into::into)),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        debug!("tcp {}: connect failed: {}", conn.link(), e);
        shared.stats.record_upstream_error();
        shared.send_reset(conn, inner);
        shared.finish(conn, inner, CloseReason::Error);
    }
}

/// Read until the socket would block, emitting one PSH,ACK per read.
fn read_upstream(shared: &TcpShared, conn: &Connection, inner: &mut ConnectionInner) -> Result<()> {
    let limit = shared.read_limit();
    loop {
        let mut packet = inner.template.duplicate_with_capacity(inner.template.len() + limit);
        let read = {
            let Some(stream) = inner.upstream.receiver_mut().stream_mut() else {
                return Ok(());
            };
            let mut payload = packet.payload_editor(PayloadMode::WriteNow { limit })?;
            match stream.read(payload.bytes_mut()) {
                Ok(n) => {
                    payload.flip_and_commit(n)?;
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        };

        match read {
            Ok(0) => {
                on_upstream_eof(shared, conn, inner)?;
                return Ok(());
            }
            Ok(n) => {
                stamp_headers(&mut packet, inner, TcpFlags::psh_ack())?;
                trace!("tcp {}: -> {} bytes seq={}", conn.link(), n, inner.tcb.local_seq);
                shared.send(packet);
                inner.tcb.advance_seq(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn on_upstream_eof(shared: &TcpShared, conn: &Connection, inner: &mut ConnectionInner) -> Result<()> {
    debug!("tcp {}: upstream EOF in {}", conn.link(), inner.tcb.state);
    if let Some(flags) = half_close(inner, Finished::Upstream)? {
        shared.reply(inner, flags)?;
        if flags.fin {
            inner.tcb.advance_seq(1);
        }
    }
    Ok(())
}
