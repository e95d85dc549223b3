//! Readiness selector shared between a selector thread and the packet path.

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Token reserved for the selector's waker.
pub const WAKE_TOKEN: Token = Token(0);

/// Owned by the thread that polls.
pub struct Selector {
    poll: Poll,
    handle: Arc<SelectorHandle>,
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll,
            handle: Arc::new(SelectorHandle {
                registry,
                waker,
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            }),
        })
    }

    pub fn handle(&self) -> Arc<SelectorHandle> {
        self.handle.clone()
    }

    /// Block until readiness, a wake-up or the timeout. Interrupted waits
    /// return with no events.
    pub fn select(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            other => other,
        }
    }
}

/// Cloneable side of a [`Selector`]: registration and wake-ups from any thread.
pub struct SelectorHandle {
    registry: Registry,
    waker: Waker,
    next_token: AtomicUsize,
}

impl SelectorHandle {
    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }

    /// Move `source` from the `current` interest set to `desired`
    /// (`None` meaning not registered), waking the selector first so a
    /// thread blocked in `select` never misses the change.
    pub fn apply<S>(
        &self,
        source: &mut S,
        token: Token,
        current: &mut Option<Interest>,
        desired: Option<Interest>,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if *current == desired {
            return Ok(());
        }
        self.waker.wake()?;
        match (*current, desired) {
            (None, Some(interest)) => self.registry.register(source, token, interest)?,
            (Some(_), Some(interest)) => self.registry.reregister(source, token, interest)?,
            (Some(_), None) => self.registry.deregister(source)?,
            (None, None) => {}
        }
        trace!("selector: token {} interest {:?} -> {:?}", token.0, current, desired);
        *current = desired;
        Ok(())
    }
}
