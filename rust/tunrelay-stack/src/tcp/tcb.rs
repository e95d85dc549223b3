//! TCP control block: sequence bookkeeping and session state.

use serde::Serialize;
use std::fmt;

/// Session state as seen from the relay, which plays the server role
/// toward the tunnel side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TcpState {
    /// SYN seen, upstream connect in progress.
    SynSent,
    /// SYN,ACK sent, waiting for the handshake ACK.
    SynReceived,
    Established,
    /// Client sent FIN; upstream may still send.
    CloseWait,
    /// Our FIN is out, waiting for the final ACK.
    LastAck,
    Closed,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Check if seq1 is before seq2 (handling wraparound)
pub fn seq_before(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) < 0
}

/// Check if seq1 is after seq2 (handling wraparound)
pub fn seq_after(seq1: u32, seq2: u32) -> bool {
    (seq1.wrapping_sub(seq2) as i32) > 0
}

/// Check if seq1 is before or equal to seq2
pub fn seq_before_or_eq(seq1: u32, seq2: u32) -> bool {
    seq1 == seq2 || seq_before(seq1, seq2)
}

/// How an incoming segment's payload relates to what was already received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Starts exactly at the expected sequence number.
    InOrder,
    /// Overlaps already received data; the first `skip` bytes are old.
    Partial { skip: usize },
    /// Entirely received before.
    Duplicate,
    /// Starts beyond the expected sequence number.
    Future,
}

/// Per-flow counters.
///
/// `local_*` describe the relay's side of the tunnel conversation:
/// `local_seq` is the next sequence number we send and `local_ack` the next
/// byte we expect from the client. `remote_*` track what the client last
/// told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tcb {
    pub local_seq: u32,
    pub local_ack: u32,
    pub remote_seq: u32,
    pub remote_ack: u32,
    pub state: TcpState,
}

impl Tcb {
    /// Control block for a fresh SYN carrying `peer_seq`.
    pub fn new(isn: u32, peer_seq: u32) -> Self {
        Self {
            local_seq: isn,
            local_ack: peer_seq.wrapping_add(1),
            remote_seq: peer_seq,
            remote_ack: 0,
            state: TcpState::SynSent,
        }
    }

    /// Record the sequence/ack fields of a segment from the client.
    pub fn observe(&mut self, seq: u32, ack: u32) {
        self.remote_seq = seq;
        self.remote_ack = ack;
    }

    /// Classify `len` payload bytes starting at `seq`.
    pub fn accept(&self, seq: u32, len: usize) -> Acceptance {
        let seq_end = seq.wrapping_add(len as u32);
        if seq_before_or_eq(seq_end, self.local_ack) {
            return Acceptance::Duplicate;
        }
        if seq == self.local_ack {
            return Acceptance::InOrder;
        }
        if seq_before(seq, self.local_ack) && seq_after(seq_end, self.local_ack) {
            let skip = self.local_ack.wrapping_sub(seq) as usize;
            return Acceptance::Partial { skip };
        }
        Acceptance::Future
    }

    /// Advance the expected client sequence by `len` received bytes.
    pub fn advance_ack(&mut self, len: usize) {
        self.local_ack = self.local_ack.wrapping_add(len as u32);
    }

    /// Advance our own sequence by `len` sent bytes (SYN and FIN count as one).
    pub fn advance_seq(&mut self, len: usize) {
        self.local_seq = self.local_seq.wrapping_add(len as u32);
    }

    /// True once the handshake finished and the flow is not being torn down.
    pub fn is_open(&self) -> bool {
        matches!(self.state, TcpState::Established | TcpState::CloseWait)
    }
}
