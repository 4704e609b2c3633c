//! Atomic counters for node store activity.
//!
//! Every counter is a relaxed `AtomicU64`: writers never block each other and a snapshot is a
//! best-effort view, not a consistent cut.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::node::NodeKind;

/// Thread-safe counters for one [`NodeStore`](crate::NodeStore) and its clones.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Leaf rows inserted.
    leaves_created: AtomicU64,
    /// Leaf requests answered by an existing row.
    leaves_reused: AtomicU64,
    /// Composite rows inserted.
    composites_created: AtomicU64,
    /// Composite requests answered by an existing row.
    composites_reused: AtomicU64,
    /// Unique violations turned into `AlreadyExists`.
    races_absorbed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Calls issued to the backend.
    round_trips: AtomicU64,
}

impl StoreMetrics {
    /// Create a new StoreMetrics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` rows of `kind` inserted.
    #[inline]
    pub fn record_created(&self, kind: NodeKind, n: u64) {
        match kind {
            NodeKind::Leaf => self.leaves_created.fetch_add(n, Ordering::Relaxed),
            NodeKind::Composite => self.composites_created.fetch_add(n, Ordering::Relaxed),
        };
    }

    /// Record `n` requests of `kind` satisfied by existing rows.
    #[inline]
    pub fn record_reused(&self, kind: NodeKind, n: u64) {
        match kind {
            NodeKind::Leaf => self.leaves_reused.fetch_add(n, Ordering::Relaxed),
            NodeKind::Composite => self.composites_reused.fetch_add(n, Ordering::Relaxed),
        };
    }

    /// Record an absorbed unique-violation race.
    #[inline]
    pub fn record_race(&self) {
        self.races_absorbed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record cache lookups.
    #[inline]
    pub fn record_cache(&self, hits: u64, misses: u64) {
        self.cache_hits.fetch_add(hits, Ordering::Relaxed);
        self.cache_misses.fetch_add(misses, Ordering::Relaxed);
    }

    /// Record one backend call.
    #[inline]
    pub fn record_round_trip(&self) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            leaves_created: self.leaves_created.load(Ordering::Relaxed),
            leaves_reused: self.leaves_reused.load(Ordering::Relaxed),
            composites_created: self.composites_created.load(Ordering::Relaxed),
            composites_reused: self.composites_reused.load(Ordering::Relaxed),
            races_absorbed: self.races_absorbed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            round_trips: self.round_trips.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetricsSnapshot {
    /// Leaf rows inserted
    pub leaves_created: u64,
    /// Leaf requests answered by an existing row
    pub leaves_reused: u64,
    /// Composite rows inserted
    pub composites_created: u64,
    /// Composite requests answered by an existing row
    pub composites_reused: u64,
    /// Unique violations absorbed
    pub races_absorbed: u64,
    /// Hash cache hits
    pub cache_hits: u64,
    /// Hash cache misses
    pub cache_misses: u64,
    /// Backend calls issued
    pub round_trips: u64,
}

impl StoreMetricsSnapshot {
    /// Fraction of node requests answered by existing rows. Returns 0.0 before any request.
    pub fn reuse_ratio(&self) -> f64 {
        let reused = self.leaves_reused + self.composites_reused;
        let total = reused + self.leaves_created + self.composites_created;
        if total == 0 {
            0.0
        } else {
            reused as f64 / total as f64
        }
    }

    /// Fraction of cache lookups that hit. Returns 0.0 before any lookup.
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
