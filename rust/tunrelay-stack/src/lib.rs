//! tunrelay stack - user-space NAT relay for TUN devices
//!
//! Every IPv4 packet read from a TUN device is terminated locally and
//! relayed over a real socket: TCP flows get a handshake synthesized by the
//! relay and a non-blocking upstream stream, UDP flows get a connected
//! datagram socket. Replies are turned back into packets and written to
//! the device.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     TUN device                              |
//! +-------------------------------------------------------------+
//!                 |                          ^
//!                 v                          |
//! +-------------------------------------------------------------+
//! |  tunnel-io thread: TunReader / TunWriter + packet hooks     |
//! |             IpProtocolDispatcher (by protocol id)           |
//! +-------------------------------------------------------------+
//!          |                 |                    ^
//!          v                 v                    | downlink queue
//! +-----------------+ +-----------------+ +----------------------+
//! | tcp-transmitter | | udp-transmitter | | tcp-/udp-receiver    |
//! | TCB state       | | channel cache   | | selector loops       |
//! +-----------------+ +-----------------+ +----------------------+
//!          |                 |                    ^
//!          v                 v                    |
//! +-------------------------------------------------------------+
//! |        protected upstream sockets (TCP / UDP)               |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tunrelay_stack::{DeviceConfig, Engine, FdDevice};
//!
//! let device = FdDevice::open(DeviceConfig::default())?;
//! let engine = Engine::builder().session_capacity(128).build()?;
//! engine.start(Arc::new(device))?;
//! // ...
//! engine.stop();
//! ```

pub mod config;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod link;
pub mod monitor;
pub mod packet;
pub mod protect;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod selector;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use config::{EngineConfig, LogLevel, TcpConfig, TunnelConfig, UdpConfig};
pub use device::{
    ChannelSink, DeviceConfig, FdDevice, Overflow, PacketSink, PacketSource, TunReader, TunWriter,
    VirtualDevice,
};
pub use dispatch::IpProtocolDispatcher;
pub use engine::{Engine, EngineBuilder};
pub use error::{Result, StackError};
pub use events::{CloseReason, EventBus, FlowEvent, Protocol};
pub use hooks::{Direction, HookTable, HookVerdict, PacketHook, RedirectHook};
pub use link::Link;
pub use monitor::{Monitor, MonitorSnapshot, ThreadState};
pub use packet::{LayerKind, Packet, PacketBuilder, PayloadMode, TcpFlags};
pub use protect::{CallbackProtector, NoopProtector, SocketProtector};
pub use queue::{Attachments, DataTransferQueue, Delivery, RetentionListener, TransferReceiver};
pub use registry::{SessionEntry, SessionRegistry, DEFAULT_CAPACITY};
pub use runner::{Task, TaskRunner};
pub use stats::{StackStats, StatsSnapshot};
pub use tcp::{Connection, Tcb, TcpState};
pub use udp::UdpChannel;

#[cfg(test)]
mod tests;
