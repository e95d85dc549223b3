//! One relayed TCP flow.

use super::tcb::{Tcb, TcpState};
use super::upstream::{UpstreamCommand, UpstreamWriter};
use crate::link::Link;
use crate::packet::Packet;
use crate::queue::{DataTransferQueue, RetentionListener};
use crate::registry::SessionEntry;
use crate::selector::SelectorHandle;
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

pub type UpstreamQueue = DataTransferQueue<UpstreamWriter, UpstreamCommand>;

/// Flow state guarded by the per-connection lock.
pub struct ConnectionInner {
    pub tcb: Tcb,
    pub upstream: UpstreamQueue,
    /// The stashed SYN until the handshake reply is sent, then a reversed
    /// header-only packet every later segment is stamped from.
    pub template: Packet,
    /// MSS the client advertised in its SYN.
    pub client_mss: Option<u16>,
    /// Upstream reached end of stream.
    pub upstream_eof: bool,
    pub interest: Option<Interest>,
    pub closed: bool,
    pub extras: HashMap<String, String>,
}

impl ConnectionInner {
    /// Client bytes acknowledged but not yet taken by the upstream socket.
    pub fn upstream_buffered(&self) -> usize {
        self.upstream.receiver().backlog_len() + self.upstream.pending_bytes()
    }

    /// Interest the upstream socket should currently be registered with.
    pub fn desired_interest(&self) -> Option<Interest> {
        if self.closed {
            return None;
        }
        if self.tcb.state == TcpState::SynSent {
            // connect readiness
            return Some(Interest::WRITABLE);
        }
        let readable = self.tcb.is_open() && !self.upstream_eof;
        let writable = self.upstream.receiver().has_backlog() || self.upstream.depth() > 0;
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub struct Connection {
    link: Link,
    token: Token,
    client: SocketAddrV4,
    selector: Arc<SelectorHandle>,
    reported: AtomicBool,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: Link,
        token: Token,
        client: SocketAddrV4,
        selector: Arc<SelectorHandle>,
        tcb: Tcb,
        stream: TcpStream,
        listeners: Vec<Arc<dyn RetentionListener>>,
        syn: Packet,
        client_mss: Option<u16>,
    ) -> Self {
        let upstream = DataTransferQueue::new(UpstreamWriter::new(stream)).with_listeners(listeners);
        Self {
            link,
            token,
            client,
            selector,
            reported: AtomicBool::new(false),
            inner: Mutex::new(ConnectionInner {
                tcb,
                upstream,
                template: syn,
                client_mss,
                upstream_eof: false,
                interest: None,
                closed: false,
                extras: HashMap::new(),
            }),
        }
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Tunnel-side address of the flow's initiator.
    pub fn client(&self) -> SocketAddrV4 {
        self.client
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> TcpState {
        self.inner.lock().tcb.state
    }

    pub fn tcb(&self) -> Tcb {
        self.inner.lock().tcb
    }

    pub fn upstream_buffered(&self) -> usize {
        self.inner.lock().upstream_buffered()
    }

    pub fn upstream_finished(&self) -> bool {
        self.inner.lock().upstream_eof
    }

    pub fn set_extra(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().extras.insert(key.into(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<String> {
        self.inner.lock().extras.get(key).cloned()
    }

    /// Bring the selector registration in line with the flow state.
    pub fn update_interest(&self, inner: &mut ConnectionInner) -> io::Result<()> {
        let desired = inner.desired_interest();
        let ConnectionInner {
            upstream, interest, ..
        } = inner;
        match upstream.receiver_mut().stream_mut() {
            Some(stream) => self.selector.apply(stream, self.token, interest, desired),
            None => {
                *interest = None;
                Ok(())
            }
        }
    }

    /// Deregister and close the upstream socket. Idempotent.
    pub fn close_socket(&self, inner: &mut ConnectionInner) {
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.tcb.state = TcpState::Closed;
        if let Err(e) = self.update_interest(inner) {
            trace!("{}: deregister failed: {}", self.link, e);
        }
        inner.upstream.receiver_mut().close();
    }

    /// True for the first caller only; used so a close is reported once.
    pub(crate) fn mark_reported(&self) -> bool {
        !self.reported.swap(true, Ordering::AcqRel)
    }
}

impl SessionEntry for Arc<Connection> {
    fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.close_socket(&mut inner);
    }
}
