//! One relayed UDP flow backed by a connected datagram socket.

use crate::error::{Result, StackError};
use crate::link::Link;
use crate::packet::{Packet, PacketBuilder};
use crate::protect::SocketProtector;
use crate::registry::SessionEntry;
use crate::selector::SelectorHandle;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use parking_lot::{Mutex, MutexGuard};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

pub struct ChannelInner {
    pub socket: Option<UdpSocket>,
    /// Reversed IPv4+UDP header (remote -> client) replies are stamped from.
    pub template: Packet,
    pub interest: Option<Interest>,
}

pub struct UdpChannel {
    link: Link,
    token: Token,
    client: SocketAddrV4,
    selector: Arc<SelectorHandle>,
    reported: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
    inner: Mutex<ChannelInner>,
}

/// Open a protected, non-blocking datagram socket connected to `remote`.
pub fn open_socket(remote: SocketAddrV4, protector: &dyn SocketProtector) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    let fd = socket.as_raw_fd();
    if !protector.protect(fd) {
        return Err(StackError::SocketUnprotected(fd));
    }
    socket.set_nonblocking(true)?;
    socket.connect(&SocketAddr::V4(remote).into())?;
    let socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(socket))
}

impl UdpChannel {
    pub fn new(
        link: Link,
        token: Token,
        client: SocketAddrV4,
        selector: Arc<SelectorHandle>,
        socket: UdpSocket,
        capacity: usize,
    ) -> Self {
        let template = PacketBuilder::udp_template(link.remote(), client, capacity);
        Self {
            link,
            token,
            client,
            selector,
            reported: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            inner: Mutex::new(ChannelInner {
                socket: Some(socket),
                template,
                interest: None,
            }),
        }
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn client(&self) -> SocketAddrV4 {
        self.client
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().socket.is_some()
    }

    /// Datagrams sent upstream and received back.
    pub fn counters(&self) -> (u64, u64) {
        (self.sent.load(Ordering::Relaxed), self.received.load(Ordering::Relaxed))
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Register for read readiness.
    pub fn watch(&self, inner: &mut ChannelInner) -> io::Result<()> {
        let ChannelInner {
            socket, interest, ..
        } = inner;
        match socket {
            Some(socket) => self
                .selector
                .apply(socket, self.token, interest, Some(Interest::READABLE)),
            None => Ok(()),
        }
    }

    /// Deregister and drop the socket. Idempotent.
    pub fn close(&self, inner: &mut ChannelInner) {
        let ChannelInner {
            socket, interest, ..
        } = inner;
        if let Some(mut socket) = socket.take() {
            if let Err(e) = self.selector.apply(&mut socket, self.token, interest, None) {
                trace!("udp {}: deregister failed: {}", self.link, e);
            }
        }
        *interest = None;
    }

    pub(crate) fn mark_reported(&self) -> bool {
        !self.reported.swap(true, Ordering::AcqRel)
    }
}

impl SessionEntry for Arc<UdpChannel> {
    fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
    }
}
