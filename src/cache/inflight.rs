//! Registry of keys currently being served.
//!
//! Each entry maps a [`CacheKey`] to the [`PooledLock`] checked out for it.
//! An entry is either absent or held by `n >= 1` registrants; every
//! transition happens under the key's map shard, so a join can never observe
//! an entry that a concurrent leave is tearing down.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::key::CacheKey;
use super::pool::PooledLock;

/// Result of [`InFlightRegistry::register`].
#[derive(Debug)]
pub struct Registration {
    /// The lock now serving the key.
    pub lock: Arc<PooledLock>,
    /// A freshly borrowed lock that lost the race to an existing entry and
    /// must go back to the pool.
    pub surplus: Option<Arc<PooledLock>>,
}

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    entries: DashMap<CacheKey, Arc<PooledLock>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins an existing entry, incrementing its hold count.
    pub fn join(&self, key: &CacheKey) -> Option<Arc<PooledLock>> {
        let entry = self.entries.get_mut(key)?;
        entry.holds().fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(entry.value()))
    }

    /// Inserts `borrowed` for `key` with a hold count of one, or joins the
    /// entry another registrant created since [`join`](Self::join) missed.
    pub fn register(&self, key: CacheKey, borrowed: Arc<PooledLock>) -> Registration {
        match self.entries.entry(key) {
            Entry::Occupied(occupied) => {
                let lock = occupied.get();
                lock.holds().fetch_add(1, Ordering::AcqRel);
                Registration {
                    lock: Arc::clone(lock),
                    surplus: Some(borrowed),
                }
            }
            Entry::Vacant(vacant) => {
                borrowed.holds().store(1, Ordering::Release);
                vacant.insert(Arc::clone(&borrowed));
                Registration {
                    lock: borrowed,
                    surplus: None,
                }
            }
        }
    }

    /// Drops one hold on `key`. When the count reaches zero the entry is
    /// removed and its lock is returned for release to the pool.
    pub fn leave(&self, key: &CacheKey) -> Option<Arc<PooledLock>> {
        self.entries
            .remove_if(key, |_, lock| {
                lock.holds().fetch_sub(1, Ordering::AcqRel) == 1
            })
            .map(|(_, lock)| lock)
    }

    /// Current hold count for `key`, or zero when absent.
    pub fn hold_count(&self, key: &CacheKey) -> usize {
        self.entries
            .get(key)
            .map(|lock| lock.hold_count())
            .unwrap_or(0)
    }

    /// Number of keys currently holding a pooled lock.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::pool::LockPool;
    use crate::config::CacheConfig;
    use crate::cache::key::KeyFingerprinter;
    use crate::http::Request;

    fn key(path: &str) -> CacheKey {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n");
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        KeyFingerprinter::from_config(&CacheConfig::default())
            .unwrap()
            .fingerprint(&request)
            .unwrap()
    }

    #[tokio::test]
    async fn hold_count_tracks_registrants() {
        let pool = LockPool::new(2);
        let registry = InFlightRegistry::new();
        let k = key("/a");

        assert!(registry.join(&k).is_none());
        let lock = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let reg = registry.register(k.clone(), lock);
        assert!(reg.surplus.is_none());
        assert_eq!(registry.hold_count(&k), 1);

        let joined = registry.join(&k).unwrap();
        assert_eq!(joined.id(), reg.lock.id());
        assert_eq!(registry.hold_count(&k), 2);

        assert!(registry.leave(&k).is_none());
        assert_eq!(registry.hold_count(&k), 1);

        let returned = registry.leave(&k).unwrap();
        assert!(registry.is_empty());
        pool.release(returned);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn losing_register_race_yields_surplus() {
        let pool = LockPool::new(2);
        let registry = InFlightRegistry::new();
        let k = key("/race");

        let first = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let second = pool.borrow(Duration::from_millis(10)).await.unwrap();
        let winner = registry.register(k.clone(), first);
        let loser = registry.register(k.clone(), second);

        assert_eq!(winner.lock.id(), loser.lock.id());
        let surplus = loser.surplus.unwrap();
        assert_ne!(surplus.id(), winner.lock.id());
        assert_eq!(registry.hold_count(&k), 2);
        pool.release(surplus);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn leave_on_absent_key_is_noop() {
        let registry = InFlightRegistry::new();
        assert!(registry.leave(&key("/nothing")).is_none());
    }
}
