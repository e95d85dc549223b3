//! Engine configuration, loadable from YAML.
//!
//! Every field has a default so an empty document is a valid configuration.

use crate::error::{Result, StackError};
use crate::registry::DEFAULT_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Capacity of the lifecycle event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
    /// Upper bound for the MSS advertised to the tunnel side.
    #[serde(default = "default_mss")]
    pub mss: u16,
    #[serde(default = "default_window")]
    pub window: u16,
    /// Depth of the queue between the tunnel reader and the TCP transmitter.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Bytes a flow may hold for a slow upstream before client segments
    /// are left unacknowledged.
    #[serde(default = "default_upstream_buffer")]
    pub upstream_buffer: usize,
    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_session_capacity")]
    pub channel_capacity: usize,
    /// Attempts made when a send reports it would block.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// Depth of the downlink queue feeding the tunnel writer.
    #[serde(default = "default_queue_capacity")]
    pub write_queue: usize,
    /// How long a producer waits for room in the downlink queue.
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
}

fn default_mtu() -> usize {
    1500
}

fn default_event_capacity() -> usize {
    1024
}

fn default_session_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_mss() -> u16 {
    1360
}

fn default_window() -> u16 {
    65535
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_upstream_buffer() -> usize {
    256 * 1024
}

fn default_select_timeout_ms() -> u64 {
    250
}

fn default_send_retries() -> u32 {
    3
}

fn default_idle_sleep_ms() -> u64 {
    10
}

fn default_write_wait_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            log_level: LogLevel::default(),
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            tunnel: TunnelConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            session_capacity: default_session_capacity(),
            mss: default_mss(),
            window: default_window(),
            queue_capacity: default_queue_capacity(),
            upstream_buffer: default_upstream_buffer(),
            select_timeout_ms: default_select_timeout_ms(),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_session_capacity(),
            send_retries: default_send_retries(),
            queue_capacity: default_queue_capacity(),
            select_timeout_ms: default_select_timeout_ms(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            idle_sleep_ms: default_idle_sleep_ms(),
            write_queue: default_queue_capacity(),
            write_wait_ms: default_write_wait_ms(),
        }
    }
}

impl TcpConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }
}

impl UdpConfig {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }
}

impl TunnelConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }
}

impl EngineConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        // serde_yaml rejects an empty document; treat it as all defaults
        let config: EngineConfig = if s.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(s)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Largest TCP payload that fits a single tunnel packet.
    pub fn max_segment(&self) -> usize {
        self.mtu - 40
    }

    /// Largest UDP payload that fits a single tunnel packet.
    pub fn max_datagram(&self) -> usize {
        self.mtu - 28
    }

    pub fn validate(&self) -> Result<()> {
        if !(576..=65535).contains(&self.mtu) {
            return Err(StackError::Config(format!("mtu {} outside 576..=65535", self.mtu)));
        }
        let capacities = [
            ("tcp.session_capacity", self.tcp.session_capacity),
            ("tcp.queue_capacity", self.tcp.queue_capacity),
            ("tcp.upstream_buffer", self.tcp.upstream_buffer),
            ("udp.channel_capacity", self.udp.channel_capacity),
            ("udp.queue_capacity", self.udp.queue_capacity),
            ("tunnel.write_queue", self.tunnel.write_queue),
            ("event_capacity", self.event_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(StackError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.tcp.mss == 0 || self.tcp.mss as usize > self.max_segment() {
            return Err(StackError::Config(format!(
                "tcp.mss {} must be between 1 and mtu - 40 ({})",
                self.tcp.mss,
                self.max_segment()
            )));
        }
        Ok(())
    }
}
