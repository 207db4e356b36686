//! Pluggable `key → entry` storage with an eviction hook.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use super::codec::ContentEncoding;
use super::key::CacheKey;
use crate::http::{Headers, StatusCode};

/// Facts about a stored entry that are not replayed as headers.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    pub status: StatusCode,
    /// Body length before compression.
    pub original_size: usize,
    pub stored_at: SystemTime,
}

/// A captured 2xx response.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub headers: Headers,
    pub body: Bytes,
    pub encoding: ContentEncoding,
    pub metadata: EntryMetadata,
}

impl CachedEntry {
    /// Size of the body at rest.
    pub fn stored_size(&self) -> usize {
        self.body.len()
    }
}

/// Callback fired when a store drops an entry on its own.
///
/// Runs on whatever thread triggered the eviction.
pub type EvictionListener = Arc<dyn Fn(&CacheKey, &CachedEntry) + Send + Sync>;

/// Storage backend for cached responses. Implementations are internally
/// thread-safe.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>>;

    fn put(&self, key: CacheKey, entry: CachedEntry);

    /// Registers the single eviction listener, replacing any previous one.
    fn on_eviction(&self, listener: EvictionListener);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-memory LRU store.
pub struct MemoryStore {
    entries: Mutex<LruCache<CacheKey, Arc<CachedEntry>>>,
    listener: RwLock<Option<EvictionListener>>,
}

impl MemoryStore {
    /// Creates a store holding at most `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            listener: RwLock::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: CacheKey, entry: CachedEntry) {
        let displaced = self.entries.lock().push(key.clone(), Arc::new(entry));

        // Replacing the same key is an overwrite, not an eviction.
        let Some((evicted_key, evicted)) = displaced.filter(|(k, _)| *k != key) else {
            return;
        };
        // Fire outside the map lock so the listener may call back into the store.
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&evicted_key, &evicted);
        }
    }

    fn on_eviction(&self, listener: EvictionListener) {
        *self.listener.write() = Some(listener);
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
