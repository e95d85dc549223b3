//! Downlink half of the UDP engine.

use super::channel::UdpChannel;
use super::UdpShared;
use crate::error::Result;
use crate::events::CloseReason;
use crate::packet::{next_ip_id, PayloadMode};
use crate::selector::{Selector, WAKE_TOKEN};
use mio::Events;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 256;

pub struct UdpReceiver {
    shared: Arc<UdpShared>,
    selector: Selector,
    events: Events,
}

impl UdpReceiver {
    pub fn new(shared: Arc<UdpShared>, selector: Selector) -> Self {
        Self {
            shared,
            selector,
            events: Events::with_capacity(EVENT_CAPACITY),
        }
    }

    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        let timeout = self.shared.config.udp.select_timeout();
        while running.load(Ordering::Relaxed) {
            self.poll_once(Some(timeout))?;
        }
        Ok(())
    }

    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        self.selector.select(&mut self.events, timeout)?;
        let mut handled = 0;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let channel = self
                .shared
                .tokens
                .get(&event.token())
                .map(|entry| entry.value().clone());
            if let Some(channel) = channel {
                drain(&self.shared, &channel);
                handled += 1;
            }
        }
        Ok(handled)
    }
}

/// Receive every queued reply and forward it to the tunnel.
///
/// Replies are read into one byte more than fits a tunnel packet, so an
/// oversize datagram is seen whole and dropped instead of truncated.
fn drain(shared: &UdpShared, channel: &Arc<UdpChannel>) {
    let limit = shared.config.max_datagram();
    let window = limit + 1;
    let mut inner = channel.lock();
    loop {
        let mut packet = inner.template.duplicate_with_capacity(inner.template.len() + window);
        let Some(socket) = inner.socket.as_ref() else {
            return;
        };

        let received = (|| -> Result<Option<usize>> {
            let mut payload = packet.payload_editor(PayloadMode::WriteNow { limit: window })?;
            match socket.recv(payload.bytes_mut()) {
                Ok(n) if n > limit => Ok(Some(n)),
                Ok(n) => {
                    payload.flip_and_commit(n)?;
                    Ok(Some(n))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e.into()),
            }
        })();

        match received {
            Ok(None) => return,
            Ok(Some(n)) if n > limit => {
                debug!("udp {}: reply exceeds {} bytes, dropped", channel.link(), limit);
                shared.stats.record_dropped();
            }
            Ok(Some(n)) => {
                let stamped = packet
                    .ipv4_editor()
                    .and_then(|mut ip| {
                        ip.set_identification(next_ip_id());
                        ip.commit()
                    });
                if let Err(e) = stamped {
                    debug!("udp {}: could not stamp reply: {}", channel.link(), e);
                    continue;
                }
                channel.record_received();
                trace!("udp {}: <- {} bytes", channel.link(), n);
                shared.send(packet);
            }
            Err(e) => {
                debug!("udp {}: receive failed: {}", channel.link(), e);
                shared.stats.record_upstream_error();
                shared.finish(channel, &mut inner, CloseReason::Error);
                return;
            }
        }
    }
}
