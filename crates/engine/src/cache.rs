//! In-memory LRU record cache.
//!
//! Fixed-capacity mapping from record key (`{collection}:{id}`) to the
//! decoded record. The cache is a read accelerator only: correctness is
//! owned by the KV substrate, and the write path re-applies entries
//! after each durable commit. No TTL; capacity overflow evicts the
//! least-recently-used entry.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use plinth_types::Record;

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Entries currently held.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Lookup hits since start.
    pub hits: u64,
    /// Lookup misses since start.
    pub misses: u64,
}

/// Bounded LRU cache of decoded records.
pub struct RecordCache {
    inner: Mutex<LruCache<String, Arc<Record>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RecordCache {
    /// Creates a cache holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a record, marking it most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<Arc<Record>> {
        let value = self.inner.lock().get(key).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Inserts or overwrites an entry. Used by the write path after a
    /// durable commit, where the new value is authoritative.
    pub fn set(&self, key: String, value: Arc<Record>) {
        self.inner.lock().put(key, value);
    }

    /// Inserts an entry only if it is not older than what is cached.
    ///
    /// Used by cache fills on the read path: a loader that raced a write
    /// must not overwrite the fresher post-commit entry, and `_version`
    /// orders the two.
    pub fn set_if_newer(&self, key: String, value: Arc<Record>) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.peek(&key)
            && existing.version() > value.version()
        {
            return;
        }
        inner.put(key, value);
    }

    /// Removes an entry if present.
    pub fn delete(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.len(),
            max_size: inner.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("RecordCache")
            .field("size", &stats.size)
            .field("max_size", &stats.max_size)
            .finish()
    }
}
