//! Statistics tracking for the relay
//!
//! Lock-free counters updated on the data path and read by the monitor.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Stack-wide statistics
#[derive(Debug, Default)]
pub struct StackStats {
    /// Start time
    start_time: Option<Instant>,

    // Packet statistics
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,

    // Byte statistics
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Protocol statistics
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub icmp_packets: AtomicU64,
    pub other_packets: AtomicU64,

    // Flow statistics
    pub tcp_connections_total: AtomicU64,
    pub tcp_connections_active: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,
    pub resets_sent: AtomicU64,
    pub evictions: AtomicU64,

    // Error statistics
    pub upstream_errors: AtomicU64,
    pub protect_failures: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Packet read from the tunnel
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packet written to the tunnel
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_icmp(&self) {
        self.icmp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_connection(&self) {
        self.tcp_connections_total.fetch_add(1, Ordering::Relaxed);
        self.tcp_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp_closed(&self) {
        self.tcp_connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_udp_session(&self) {
        self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
        self.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp_closed(&self) {
        self.udp_sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protect_failure(&self) {
        self.protect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all statistics
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            icmp_packets: self.icmp_packets.load(Ordering::Relaxed),
            other_packets: self.other_packets.load(Ordering::Relaxed),
            tcp_connections_total: self.tcp_connections_total.load(Ordering::Relaxed),
            tcp_connections_active: self.tcp_connections_active.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            protect_failures: self.protect_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub other_packets: u64,
    pub tcp_connections_total: u64,
    pub tcp_connections_active: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub resets_sent: u64,
    pub evictions: u64,
    pub upstream_errors: u64,
    pub protect_failures: u64,
}
