//! Capacity-bounded LRU table of live flows.

use crate::link::Link;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tracing::debug;

/// Default number of flows kept before the least recently used one is evicted.
pub const DEFAULT_CAPACITY: usize = 64;

/// An entry that owns a real socket.
pub trait SessionEntry: Clone + Send + Sync {
    /// Close the underlying socket without any protocol-level goodbye.
    fn force_close(&self);
}

/// LRU map from [`Link`] to a session entry.
///
/// The size never exceeds the capacity: inserting a new link into a full
/// table evicts the least recently used entry and force-closes it. Entries
/// are closed after the table lock is released, so `force_close` may take
/// per-flow locks.
pub struct SessionRegistry<V: SessionEntry> {
    name: &'static str,
    inner: Mutex<LruCache<Link, V>>,
}

impl<V: SessionEntry> SessionRegistry<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up and mark as most recently used.
    pub fn get(&self, link: &Link) -> Option<V> {
        self.inner.lock().get(link).cloned()
    }

    /// Look up without touching the recency order.
    pub fn peek(&self, link: &Link) -> Option<V> {
        self.inner.lock().peek(link).cloned()
    }

    pub fn contains(&self, link: &Link) -> bool {
        self.inner.lock().contains(link)
    }

    /// Insert, returning whatever entry was displaced (the previous value for
    /// the same link, or the evicted LRU entry). That entry is force-closed.
    pub fn insert(&self, link: Link, value: V) -> Option<(Link, V)> {
        let displaced = {
            let mut cache = self.inner.lock();
            if cache.contains(&link) {
                cache.put(link, value).map(|old| (link, old))
            } else {
                cache.push(link, value)
            }
        };
        if let Some((old_link, old)) = &displaced {
            debug!("{}: evicting {}", self.name, old_link);
            old.force_close();
        }
        displaced
    }

    /// Remove without closing.
    pub fn remove(&self, link: &Link) -> Option<V> {
        self.inner.lock().pop(link)
    }

    /// Remove only if the current entry for `link` satisfies `pred`.
    ///
    /// Used to avoid dropping a newer flow that reuses a link.
    pub fn remove_if(&self, link: &Link, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut cache = self.inner.lock();
        if cache.peek(link).is_some_and(pred) {
            cache.pop(link)
        } else {
            None
        }
    }

    /// Entries from most to least recently used.
    pub fn entries(&self) -> Vec<(Link, V)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Drain the table and force-close every entry.
    pub fn close_all(&self) -> Vec<(Link, V)> {
        let drained: Vec<(Link, V)> = {
            let mut cache = self.inner.lock();
            let mut out = Vec::with_capacity(cache.len());
            while let Some(entry) = cache.pop_lru() {
                out.push(entry);
            }
            out
        };
        for (_, v) in &drained {
            v.force_close();
        }
        if !drained.is_empty() {
            debug!("{}: closed {} entries", self.name, drained.len());
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Entry(Arc<AtomicBool>);

    impl Entry {
        fn closed(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl SessionEntry for Entry {
        fn force_close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn link(port: u16) -> Link {
        Link::new(port, SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 80))
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let registry = SessionRegistry::new("test", 2);
        let (a, b, c) = (Entry::default(), Entry::default(), Entry::default());
        assert!(registry.insert(link(1), a.clone()).is_none());
        assert!(registry.insert(link(2), b.clone()).is_none());

        // touch 1 so 2 becomes the oldest
        assert!(registry.get(&link(1)).is_some());
        let evicted = registry.insert(link(3), c.clone()).unwrap();

        assert_eq!(evicted.0, link(2));
        assert!(b.closed());
        assert!(!a.closed() && !c.closed());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let registry = SessionRegistry::new("test", DEFAULT_CAPACITY);
        let entries: Vec<Entry> = (0..100).map(|_| Entry::default()).collect();
        for (i, e) in entries.iter().enumerate() {
            registry.insert(link(i as u16), e.clone());
            assert!(registry.len() <= DEFAULT_CAPACITY);
        }
        let closed = entries.iter().filter(|e| e.closed()).count();
        assert_eq!(closed, 100 - DEFAULT_CAPACITY);
        assert!(entries[..36].iter().all(Entry::closed));
    }

    #[test]
    fn test_replacing_same_link_closes_old() {
        let registry = SessionRegistry::new("test", 4);
        let (old, new) = (Entry::default(), Entry::default());
        registry.insert(link(1), old.clone());
        registry.insert(link(1), new.clone());
        assert!(old.closed());
        assert!(!new.closed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_if_checks_identity() {
        let registry = SessionRegistry::new("test", 4);
        let e = Entry::default();
        registry.insert(link(1), e.clone());
        assert!(registry.remove_if(&link(1), |v| !Arc::ptr_eq(&v.0, &e.0)).is_none());
        assert!(registry.remove_if(&link(1), |v| Arc::ptr_eq(&v.0, &e.0)).is_some());
        assert!(!e.closed());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_all() {
        let registry = SessionRegistry::new("test", 4);
        let entries: Vec<Entry> = (0..3).map(|_| Entry::default()).collect();
        for (i, e) in entries.iter().enumerate() {
            registry.insert(link(i as u16), e.clone());
        }
        assert_eq!(registry.close_all().len(), 3);
        assert!(entries.iter().all(Entry::closed));
        assert!(registry.is_empty());
    }
}
