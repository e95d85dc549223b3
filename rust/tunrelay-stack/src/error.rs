//! Error types for the relay stack

use std::io;
use thiserror::Error;

/// Result type alias for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Main error type for the relay stack
#[derive(Error, Debug)]
pub enum StackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Packet already has a buffer attached")]
    AlreadyAttached,

    #[error("Packet has no buffer attached")]
    NotAttached,

    #[error("Layer not present: {0}")]
    MissingLayer(&'static str),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("TCP error: {0}")]
    TcpError(String),

    #[error("UDP error: {0}")]
    UdpError(String),

    #[error("Socket fd={0} could not be protected")]
    SocketUnprotected(i32),

    #[error("Device not ready")]
    DeviceNotReady,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StackError {
    /// True for errors that only mean "try again later" on a non-blocking handle.
    pub fn is_would_block(&self) -> bool {
        match self {
            StackError::DeviceNotReady => true,
            StackError::Io(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}
