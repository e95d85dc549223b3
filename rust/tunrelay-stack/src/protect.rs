//! Socket protection: keep the relay's own upstream sockets out of the tunnel.
//!
//! On platforms where the tunnel captures all traffic (Android VpnService
//! and similar), every upstream socket must be exempted from the tunnel
//! route before it connects, otherwise its packets loop back into the relay.

use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// Host-supplied capability invoked on every upstream socket before connect.
pub trait SocketProtector: Send + Sync {
    /// Returns false if the socket could not be protected.
    fn protect(&self, fd: RawFd) -> bool;
}

/// Accepts every socket. For hosts whose routing already excludes the relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}

/// Wraps a host callback such as `VpnService.protect`.
pub struct CallbackProtector<F> {
    callback: F,
}

impl<F> CallbackProtector<F>
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> SocketProtector for CallbackProtector<F>
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        let ok = (self.callback)(fd);
        if ok {
            debug!("Socket fd={} protected", fd);
        } else {
            warn!("Socket fd={} protection FAILED", fd);
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_callback_sees_fd() {
        let seen = Arc::new(AtomicI32::new(-1));
        let seen2 = seen.clone();
        let protector = CallbackProtector::new(move |fd| {
            seen2.store(fd, Ordering::SeqCst);
            fd != 13
        });
        assert!(protector.protect(7));
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert!(!protector.protect(13));
        assert!(NoopProtector.protect(13));
    }
}
