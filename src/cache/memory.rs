//! # Memory Cache
//!
//! Cost-bounded least-recently-used map from address to cached payload.
//! Pure data structure: no operation blocks on I/O, and everything is
//! serialized by a single mutex.

use hashlink::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::types::CacheEntry;

struct Inner {
    entries: LruCache<String, CacheEntry>,
    bytes_used: usize,
}

/// Thread-safe LRU cache bounded by a byte budget.
///
/// Cost of an entry is its payload length. Eviction is strictly
/// least-recently-used, ties broken by insertion order; after every insert
/// the total cost of resident entries is back within the budget.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl MemoryCache {
    /// Create a cache with the given byte budget.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "memory cache capacity must be greater than zero");

        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new_unbounded(),
                bytes_used: 0,
            }),
            capacity,
        }
    }

    /// Look up an entry, bumping its recency on hit.
    pub fn get(&self, address: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(address).cloned()
    }

    /// Insert or overwrite an entry, then evict least-recently-used entries
    /// until the cache is back within budget.
    ///
    /// An entry larger than the whole budget is skipped rather than allowed
    /// to wipe the cache.
    pub fn put(&self, address: &str, entry: CacheEntry) {
        let cost = entry.cost();
        if cost > self.capacity {
            warn!(
                address,
                cost,
                capacity = self.capacity,
                "entry exceeds memory cache budget, skipping"
            );
            return;
        }

        let mut inner = self.inner.lock();

        if let Some(existing) = inner.entries.remove(address) {
            inner.bytes_used -= existing.cost();
        }

        inner.bytes_used += cost;
        inner.entries.insert(address.to_owned(), entry);

        while inner.bytes_used > self.capacity {
            match inner.entries.remove_lru() {
                Some((evicted_address, evicted)) => {
                    inner.bytes_used -= evicted.cost();
                    debug!(
                        address = %evicted_address,
                        cost = evicted.cost(),
                        "evicted least recently used entry"
                    );
                }
                None => break,
            }
        }
    }

    /// Remove an entry if present.
    pub fn remove(&self, address: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(address);
        if let Some(entry) = &removed {
            inner.bytes_used -= entry.cost();
        }
        removed
    }

    /// Total cost of resident entries, in bytes.
    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured byte budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
