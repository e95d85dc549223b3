//! UDP flow engine.
//!
//! There is no handshake: the first datagram of a [`Link`] opens a connected
//! upstream socket which is cached in an LRU table and watched for replies.
//! Replies are stamped onto a reversed header template and sent down the
//! tunnel.

pub mod channel;
pub mod receiver;
pub mod transmitter;

pub use channel::UdpChannel;
pub use receiver::UdpReceiver;
pub use transmitter::UdpTransmitter;

use crate::config::EngineConfig;
use crate::device::PacketSink;
use crate::error::Result;
use crate::events::{CloseReason, EventBus, Protocol};
use crate::link::Link;
use crate::packet::Packet;
use crate::protect::SocketProtector;
use crate::registry::SessionRegistry;
use crate::selector::SelectorHandle;
use crate::stats::StackStats;
use channel::ChannelInner;
use dashmap::DashMap;
use mio::Token;
use serde::Serialize;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tracing::debug;

/// One row of the channel cache, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub link: Link,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
}

pub struct UdpShared {
    pub(crate) config: EngineConfig,
    pub(crate) channels: SessionRegistry<Arc<UdpChannel>>,
    pub(crate) tokens: DashMap<Token, Arc<UdpChannel>>,
    pub(crate) selector: Arc<SelectorHandle>,
    pub(crate) downlink: Arc<dyn PacketSink>,
    pub(crate) protector: Arc<dyn SocketProtector>,
    pub(crate) events: EventBus,
    pub(crate) stats: Arc<StackStats>,
}

impl UdpShared {
    pub fn new(
        config: EngineConfig,
        selector: Arc<SelectorHandle>,
        downlink: Arc<dyn PacketSink>,
        protector: Arc<dyn SocketProtector>,
        events: EventBus,
        stats: Arc<StackStats>,
    ) -> Self {
        let channels = SessionRegistry::new("udp-channels", config.udp.channel_capacity);
        Self {
            config,
            channels,
            tokens: DashMap::new(),
            selector,
            downlink,
            protector,
            events,
            stats,
        }
    }

    pub fn channel(&self, link: &Link) -> Option<Arc<UdpChannel>> {
        self.channels.peek(link)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn capacity(&self) -> usize {
        self.channels.capacity()
    }

    /// Channels from most to least recently used.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .entries()
            .into_iter()
            .map(|(link, channel)| {
                let (sent, received) = channel.counters();
                ChannelInfo {
                    link,
                    datagrams_sent: sent,
                    datagrams_received: received,
                }
            })
            .collect()
    }

    /// Cached channel for `link`, opening one on a miss.
    pub(crate) fn channel_for(&self, link: Link, client: SocketAddrV4) -> Result<Arc<UdpChannel>> {
        if let Some(channel) = self.channels.get(&link) {
            return Ok(channel);
        }

        let socket = channel::open_socket(link.remote(), self.protector.as_ref())?;
        let token = self.selector.next_token();
        let channel = Arc::new(UdpChannel::new(
            link,
            token,
            client,
            self.selector.clone(),
            socket,
            self.config.mtu,
        ));
        self.tokens.insert(token, channel.clone());
        {
            let mut inner = channel.lock();
            if let Err(e) = channel.watch(&mut inner) {
                channel.close(&mut inner);
                self.tokens.remove(&token);
                return Err(e.into());
            }
        }
        if let Some((evicted, old)) = self.channels.insert(link, channel.clone()) {
            debug!("udp: channel cache full, evicted {}", evicted);
            self.forget(&old, CloseReason::Evicted);
        }
        self.stats.record_udp_session();
        self.events.opened(link, Protocol::Udp);
        debug!("udp {}: new channel", link);
        Ok(channel)
    }

    pub(crate) fn send(&self, packet: Packet) {
        if let Err(e) = self.downlink.deliver(packet) {
            debug!("udp: downlink dropped a datagram: {}", e);
            self.stats.record_dropped();
        }
    }

    /// Close the channel and drop it from the cache.
    pub(crate) fn finish(&self, channel: &Arc<UdpChannel>, inner: &mut ChannelInner, reason: CloseReason) {
        channel.close(inner);
        self.channels.remove_if(&channel.link(), |v| Arc::ptr_eq(v, channel));
        self.forget(channel, reason);
    }

    /// Account for a channel whose socket is already closed.
    pub(crate) fn forget(&self, channel: &Arc<UdpChannel>, reason: CloseReason) {
        self.tokens.remove_if(&channel.token(), |_, v| Arc::ptr_eq(v, channel));
        if channel.mark_reported() {
            debug!("udp {}: closed ({:?})", channel.link(), reason);
            if reason == CloseReason::Evicted {
                self.stats.record_eviction();
            }
            self.stats.record_udp_closed();
            self.events.closed(channel.link(), Protocol::Udp, reason);
        }
    }

    pub fn close_all(&self) -> usize {
        let drained = self.channels.close_all();
        for (_, channel) in &drained {
            self.forget(channel, CloseReason::Shutdown);
        }
        drained.len()
    }
}
