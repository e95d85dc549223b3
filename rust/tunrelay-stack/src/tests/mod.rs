//! Crate-level tests: property tests over the packet model plus loopback
//! scenarios that drive the flow engines against real sockets.

mod engine_flow;
mod udp_flow;

use crate::device::PacketSink;
use crate::error::Result;
use crate::packet::Packet;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Downlink sink that keeps everything it is given.
#[derive(Default)]
pub(crate) struct Collect {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl Collect {
    pub(crate) fn take(&self) -> Vec<Packet> {
        self.packets
            .lock()
            .drain(..)
            .map(|raw| Packet::ipv4(BytesMut::from(&raw[..])))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.packets.lock().len()
    }
}

impl PacketSink for Collect {
    fn deliver(&self, packet: Packet) -> Result<()> {
        self.packets.lock().push(packet.buffer().to_vec());
        Ok(())
    }
}

/// Run `step` until `done` holds or two seconds pass.
pub(crate) fn wait_until(mut step: impl FnMut(), mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        step();
        if done() {
            return true;
        }
    }
    done()
}
