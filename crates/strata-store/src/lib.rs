#![warn(missing_docs)]

//! Strata store subsystem: content-addressed, deduplicating node storage.
//!
//! Write path: Seed / Relations → Hash (BLAKE3) → Cache → Backend lookup → Insert (race-absorbing)
//! Read path:  NodeRef → Backend fetch (batched) → NodeRow

pub mod backend;
pub mod cache;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod node;
pub mod node_store;
pub mod projector;

pub use backend::{MemoryBackend, NodeBackend};
pub use cache::{BoundedCache, CacheStats, HashCache};
pub use error::{Result, StoreError};
pub use hash::ContentHash;
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use node::{
    canonicalize_relations, run_length_encode, NewNode, NodeBody, NodeHandle, NodeId, NodeKind,
    NodeRef, NodeRow, Relation, Seed, SeedKind,
};
pub use node_store::{GetOrCreate, NodeStore, NodeStoreConfig};
pub use projector::{LocalityKey, Point4D, Projector, SphereProjector};
