//! Flow identity.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddrV4;

/// A relayed flow: the tunnel-side source port plus the real destination.
///
/// Compared and hashed by value; used as the key of the TCP session table
/// and the UDP channel cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Link {
    local_port: u16,
    remote: SocketAddrV4,
}

impl Link {
    pub fn new(local_port: u16, remote: SocketAddrV4) -> Self {
        Self { local_port, remote }
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{} -> {}", self.local_port, self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    #[test]
    fn test_value_identity() {
        let remote = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
        let mut set = HashSet::new();
        set.insert(Link::new(40000, remote));
        assert!(set.contains(&Link::new(40000, remote)));
        assert!(!set.contains(&Link::new(40001, remote)));
        assert_eq!(Link::new(40000, remote).to_string(), ":40000 -> 1.1.1.1:443");
    }
}
