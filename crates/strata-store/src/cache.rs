//! Bounded concurrent caches for facts that never change.
//!
//! Entries are append-only facts (a content hash always maps to the same node, a node always
//! expands to the same symbols), so concurrent readers and writers need no coordination beyond
//! the map's own sharding. When the cache is full an arbitrary fraction of entries is dropped.
//! Eviction is best-effort, not LRU: a stale miss only costs a redundant round trip.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::hash::ContentHash;
use crate::node::NodeHandle;

/// Content-hash to node cache shared by concurrent ingestions.
pub type HashCache = BoundedCache<ContentHash, NodeHandle>;

/// Counters for a [`BoundedCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Current entry count
    pub entries: usize,
    /// Successful lookups
    pub hits: u64,
    /// Failed lookups
    pub misses: u64,
    /// Entries dropped by eviction
    pub evicted: u64,
}

/// Size-bounded concurrent map with fraction-based eviction.
pub struct BoundedCache<K, V> {
    map: DashMap<K, V>,
    capacity: usize,
    evict_fraction: f64,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries, dropping `evict_fraction` of them
    /// (clamped to `(0, 1]`) whenever an insert finds it full.
    pub fn new(capacity: usize, evict_fraction: f64) -> Self {
        let evict_fraction = if evict_fraction.is_finite() && evict_fraction > 0.0 {
            evict_fraction.min(1.0)
        } else {
            0.25
        };
        Self {
            map: DashMap::with_capacity(capacity.min(1 << 16)),
            capacity: capacity.max(1),
            evict_fraction,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Look up a key.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.map.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a fact, evicting first if the cache is full.
    pub fn insert(&self, key: K, value: V) {
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            self.evict();
        }
        self.map.insert(key, value);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Is the cache empty?
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Maximum entry count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    fn evict(&self) {
        let target = ((self.capacity as f64 * self.evict_fraction).ceil() as usize).max(1);
        // Collect first: removing while iterating would deadlock on the shard lock.
        let victims: Vec<K> = self
            .map
            .iter()
            .take(target)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0u64;
        for key in victims {
            if self.map.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.evicted.fetch_add(removed, Ordering::Relaxed);
        debug!(removed, capacity = self.capacity, "cache eviction");
    }
}
