//! Read-only diagnostics: thread states, queue depths and flow tables.

use crate::device::ChannelSink;
use crate::stats::{StackStats, StatsSnapshot};
use crate::tcp::{SessionInfo, TcpShared};
use crate::udp::{ChannelInfo, UdpShared};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadState {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl ThreadState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ThreadState::Running,
            2 => ThreadState::Stopped,
            3 => ThreadState::Failed,
            _ => ThreadState::Starting,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub name: &'static str,
    pub state: ThreadState,
}

/// Fixed set of named worker threads and their current state.
pub struct ThreadBoard {
    slots: Vec<(&'static str, AtomicU8)>,
}

impl ThreadBoard {
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            slots: names
                .iter()
                .map(|n| (*n, AtomicU8::new(ThreadState::Starting as u8)))
                .collect(),
        }
    }

    pub fn set(&self, name: &str, state: ThreadState) {
        if let Some((_, slot)) = self.slots.iter().find(|(n, _)| *n == name) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    pub fn get(&self, name: &str) -> Option<ThreadState> {
        self.slots
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, slot)| ThreadState::from_u8(slot.load(Ordering::Acquire)))
    }

    pub fn states(&self) -> Vec<ThreadInfo> {
        self.slots
            .iter()
            .map(|(name, slot)| ThreadInfo {
                name: *name,
                state: ThreadState::from_u8(slot.load(Ordering::Acquire)),
            })
            .collect()
    }

    /// Mark `name` running until the guard drops. A guard dropped while
    /// unwinding, or explicitly failed, leaves the thread marked `Failed`.
    pub fn guard(self: &Arc<Self>, name: &'static str) -> ThreadGuard {
        self.set(name, ThreadState::Running);
        ThreadGuard {
            board: self.clone(),
            name,
            failed: false,
        }
    }
}

pub struct ThreadGuard {
    board: Arc<ThreadBoard>,
    name: &'static str,
    failed: bool,
}

impl ThreadGuard {
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        let state = if self.failed || std::thread::panicking() {
            error!("thread {} stopped abnormally", self.name);
            ThreadState::Failed
        } else {
            ThreadState::Stopped
        };
        self.board.set(self.name, state);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueDepths {
    pub tcp_uplink: usize,
    pub udp_uplink: usize,
    pub downlink: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSnapshot<T> {
    pub size: usize,
    pub capacity: usize,
    pub entries: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub running: bool,
    pub threads: Vec<ThreadInfo>,
    pub queues: QueueDepths,
    pub tcp_sessions: TableSnapshot<SessionInfo>,
    pub udp_channels: TableSnapshot<ChannelInfo>,
    pub stats: StatsSnapshot,
}

/// Pull-side view over a running engine.
#[derive(Clone)]
pub struct Monitor {
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) threads: Arc<ThreadBoard>,
    pub(crate) tcp: Arc<TcpShared>,
    pub(crate) udp: Arc<UdpShared>,
    pub(crate) tcp_uplink: ChannelSink,
    pub(crate) udp_uplink: ChannelSink,
    pub(crate) downlink: ChannelSink,
    pub(crate) stats: Arc<StackStats>,
}

impl Monitor {
    pub fn snapshot(&self) -> MonitorSnapshot {
        let tcp_entries = self.tcp.sessions();
        let udp_entries = self.udp.channels();
        MonitorSnapshot {
            running: self.running.load(Ordering::Relaxed),
            threads: self.threads.states(),
            queues: QueueDepths {
                tcp_uplink: self.tcp_uplink.depth(),
                udp_uplink: self.udp_uplink.depth(),
                downlink: self.downlink.depth(),
            },
            tcp_sessions: TableSnapshot {
                size: tcp_entries.len(),
                capacity: self.tcp.capacity(),
                entries: tcp_entries,
            },
            udp_channels: TableSnapshot {
                size: udp_entries.len(),
                capacity: self.udp.capacity(),
                entries: udp_entries,
            },
            stats: self.stats.snapshot(),
        }
    }
}
