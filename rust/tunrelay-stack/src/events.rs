//! Flow lifecycle notifications for collaborators outside the engine.

use crate::link::Link;
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Why a flow went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Both sides finished normally.
    Finished,
    /// Reset by either side or for a protocol violation.
    Reset,
    /// Upstream connect/read/write failure.
    Error,
    /// Pushed out of a full session table.
    Evicted,
    /// Engine shutdown.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FlowEvent {
    Opened { link: Link, protocol: Protocol },
    Closed { link: Link, protocol: Protocol, reason: CloseReason },
}

/// Broadcast bus for [`FlowEvent`]s. Publishing never blocks and never fails;
/// slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: FlowEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn opened(&self, link: Link, protocol: Protocol) {
        self.publish(FlowEvent::Opened { link, protocol });
    }

    pub fn closed(&self, link: Link, protocol: Protocol, reason: CloseReason) {
        self.publish(FlowEvent::Closed { link, protocol, reason });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        let link = Link::new(1, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80));
        bus.opened(link, Protocol::Tcp);
    }

    #[test]
    fn test_subscriber_sees_events_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let link = Link::new(1, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80));
        bus.opened(link, Protocol::Udp);
        bus.closed(link, Protocol::Udp, CloseReason::Evicted);
        assert_eq!(rx.try_recv().unwrap(), FlowEvent::Opened { link, protocol: Protocol::Udp });
        assert_eq!(
            rx.try_recv().unwrap(),
            FlowEvent::Closed { link, protocol: Protocol::Udp, reason: CloseReason::Evicted }
        );
    }
}
