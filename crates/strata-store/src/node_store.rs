//! Get-or-create node store over a [`NodeBackend`].
//!
//! Every node is resolved by content hash: consult the cache, look the hash up, insert if
//! absent. A unique violation from the backend means another writer won the race; the store
//! re-reads the winner's row and reports [`GetOrCreate::AlreadyExists`]. Callers never see the
//! race.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use strata_runtime::{AsyncLimiter, CancelToken};
use tracing::{debug, warn};

use crate::backend::NodeBackend;
use crate::cache::HashCache;
use crate::error::{Result, StoreError};
use crate::hash::ContentHash;
use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::node::{canonicalize_relations, NewNode, NodeBody, NodeHandle, NodeKind, NodeRef, NodeRow, Seed};
use crate::projector::{LocalityKey, Point4D, Projector, SphereProjector};

/// Outcome of a get-or-create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOrCreate {
    /// This call inserted the row.
    Created(NodeHandle),
    /// The row already existed, possibly inserted concurrently by another writer.
    AlreadyExists(NodeHandle),
}

impl GetOrCreate {
    /// The resolved node and its point.
    pub fn handle(&self) -> NodeHandle {
        match self {
            GetOrCreate::Created(h) | GetOrCreate::AlreadyExists(h) => *h,
        }
    }

    /// The resolved node reference.
    pub fn node(&self) -> NodeRef {
        self.handle().node
    }

    /// True if this call inserted the row.
    pub fn was_created(&self) -> bool {
        matches!(self, GetOrCreate::Created(_))
    }
}

/// Store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStoreConfig {
    /// Find/insert rounds before giving up on a hash.
    pub max_insert_attempts: u32,
}

impl Default for NodeStoreConfig {
    fn default() -> Self {
        Self {
            max_insert_attempts: 3,
        }
    }
}

/// Deduplicating node store. Cloning shares the backend, cache, limiter and counters.
pub struct NodeStore<B: NodeBackend> {
    backend: Arc<B>,
    projector: Arc<dyn Projector>,
    cache: Option<Arc<HashCache>>,
    limiter: Option<AsyncLimiter>,
    metrics: Arc<StoreMetrics>,
    config: NodeStoreConfig,
}

impl<B: NodeBackend> Clone for NodeStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            projector: self.projector.clone(),
            cache: self.cache.clone(),
            limiter: self.limiter.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: NodeBackend> NodeStore<B> {
    /// Create a store with the default projector, no cache and no limiter.
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            projector: Arc::new(SphereProjector),
            cache: None,
            limiter: None,
            metrics: Arc::new(StoreMetrics::new()),
            config: NodeStoreConfig::default(),
        }
    }

    /// Replace the projector.
    pub fn with_projector(mut self, projector: Arc<dyn Projector>) -> Self {
        self.projector = projector;
        self
    }

    /// Consult and populate `cache` around every resolution.
    pub fn with_cache(mut self, cache: Arc<HashCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Hold a permit from `limiter` for every backend call.
    pub fn with_limiter(mut self, limiter: AsyncLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Replace the tuning.
    pub fn with_config(mut self, config: NodeStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// The projector used for points, locality keys and hashes.
    pub fn projector(&self) -> &Arc<dyn Projector> {
        &self.projector
    }

    /// The hash cache, if any.
    pub fn cache(&self) -> Option<&Arc<HashCache>> {
        self.cache.as_ref()
    }

    /// The backend limiter, if any.
    pub fn limiter(&self) -> Option<&AsyncLimiter> {
        self.limiter.as_ref()
    }

    /// Snapshot of store counters.
    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Get or create the leaf for `seed`.
    pub async fn get_or_create_leaf(&self, seed: Seed, token: &CancelToken) -> Result<GetOrCreate> {
        let node = self.leaf_node(seed);
        self.resolve(node, token).await
    }

    /// Get or create the composite over `children`, given in order with run-length counts.
    /// Adjacent repeats of the same child are merged before hashing.
    pub async fn get_or_create_composite(
        &self,
        children: &[(NodeHandle, u32)],
        token: &CancelToken,
    ) -> Result<GetOrCreate> {
        let refs: Vec<(NodeRef, u32)> = children.iter().map(|(h, m)| (h.node, *m)).collect();
        let relations = canonicalize_relations(&refs)?;
        let points: Vec<(Point4D, u32)> = children.iter().map(|(h, m)| (h.point, *m)).collect();
        let point = self.projector.centroid(&points);
        let node = NewNode {
            hash: self.projector.composite_hash(&relations),
            point,
            locality: self.projector.locality_key(&point),
            body: NodeBody::Composite(relations),
        };
        self.resolve(node, token).await
    }

    /// Get or create a leaf for every seed using one bulk lookup and one batch insert.
    /// A batch-level unique violation triggers a re-query of the whole missing set.
    pub async fn bulk_get_or_create_leaves(
        &self,
        seeds: &BTreeSet<Seed>,
        token: &CancelToken,
    ) -> Result<HashMap<Seed, NodeHandle>> {
        token.check()?;
        let mut resolved = HashMap::with_capacity(seeds.len());
        let mut pending: Vec<(Seed, NewNode)> = Vec::new();
        for &seed in seeds {
            let node = self.leaf_node(seed);
            match self.cache_get(&node.hash) {
                Some(handle) => {
                    self.metrics.record_reused(NodeKind::Leaf, 1);
                    resolved.insert(seed, handle);
                }
                None => pending.push((seed, node)),
            }
        }
        if pending.is_empty() {
            return Ok(resolved);
        }

        let mut missing = self.absorb_existing(pending, &mut resolved, token).await?;
        let attempts = self.config.max_insert_attempts.max(1);
        for attempt in 1..=attempts {
            if missing.is_empty() {
                break;
            }
            let rows: Vec<NewNode> = missing.iter().map(|(_, node)| node.clone()).collect();
            match self.round_trip(token, self.backend.batch_insert(rows)).await {
                Ok(handles) => {
                    if handles.len() != missing.len() {
                        return Err(StoreError::Backend(format!(
                            "batch insert returned {} rows for {} nodes",
                            handles.len(),
                            missing.len()
                        )));
                    }
                    let created = handles.len();
                    self.metrics.record_created(NodeKind::Leaf, created as u64);
                    for ((seed, node), handle) in missing.drain(..).zip(handles) {
                        self.cache_put(node.hash, handle);
                        resolved.insert(seed, handle);
                    }
                    debug!(created, resolved = resolved.len(), attempt, "bulk leaves inserted");
                }
                Err(StoreError::UniqueViolation { hash }) => {
                    self.metrics.record_race();
                    warn!(hash = %hash.short(), attempt, pending = missing.len(), "bulk leaf insert raced, re-querying");
                    missing = self.absorb_existing(missing, &mut resolved, token).await?;
                }
                Err(e) => return Err(e),
            }
        }
        match missing.first() {
            None => Ok(resolved),
            Some((_, node)) => Err(StoreError::Unresolved {
                hash: node.hash,
                attempts,
            }),
        }
    }

    /// Fetch rows by reference in one backend call. Missing references are omitted.
    pub async fn fetch(&self, refs: &[NodeRef], token: &CancelToken) -> Result<Vec<NodeRow>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        self.round_trip(token, self.backend.fetch(refs)).await
    }

    /// Fetch one row, failing with [`StoreError::NotFound`] if it does not exist.
    pub async fn get(&self, node: NodeRef, token: &CancelToken) -> Result<NodeRow> {
        self.fetch(&[node], token)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound { node })
    }

    /// Stream rows by locality key.
    pub async fn range_scan(
        &self,
        range: RangeInclusive<LocalityKey>,
        token: &CancelToken,
    ) -> Result<BoxStream<'static, Result<NodeRow>>> {
        self.round_trip(token, self.backend.range_scan(range)).await
    }

    /// Number of stored nodes of one kind.
    pub async fn count(&self, kind: NodeKind, token: &CancelToken) -> Result<usize> {
        self.round_trip(token, self.backend.count(kind)).await
    }

    fn leaf_node(&self, seed: Seed) -> NewNode {
        let point = self.projector.project(&seed);
        NewNode {
            hash: self.projector.content_hash(&seed),
            point,
            locality: self.projector.locality_key(&point),
            body: NodeBody::Leaf(seed),
        }
    }

    async fn resolve(&self, node: NewNode, token: &CancelToken) -> Result<GetOrCreate> {
        let hash = node.hash;
        let kind = node.kind();
        if let Some(handle) = self.cache_get(&hash) {
            self.metrics.record_reused(kind, 1);
            return Ok(GetOrCreate::AlreadyExists(handle));
        }

        let attempts = self.config.max_insert_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(handle) = self.round_trip(token, self.backend.find_by_hash(&hash)).await? {
                self.metrics.record_reused(kind, 1);
                self.cache_put(hash, handle);
                debug!(node = %handle.node, hash = %hash.short(), "reused");
                return Ok(GetOrCreate::AlreadyExists(handle));
            }
            match self.round_trip(token, self.backend.insert(node.clone())).await {
                Ok(handle) => {
                    self.metrics.record_created(kind, 1);
                    self.cache_put(hash, handle);
                    debug!(node = %handle.node, hash = %hash.short(), "created");
                    return Ok(GetOrCreate::Created(handle));
                }
                Err(StoreError::UniqueViolation { .. }) => {
                    self.metrics.record_race();
                    warn!(%kind, hash = %hash.short(), attempt, "unique violation absorbed, re-fetching");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Unresolved { hash, attempts })
    }

    /// Look up `pending` in one call; move found rows into `resolved`, return the rest.
    async fn absorb_existing(
        &self,
        pending: Vec<(Seed, NewNode)>,
        resolved: &mut HashMap<Seed, NodeHandle>,
        token: &CancelToken,
    ) -> Result<Vec<(Seed, NewNode)>> {
        let hashes: Vec<ContentHash> = pending.iter().map(|(_, node)| node.hash).collect();
        let found = self
            .round_trip(token, self.backend.find_many_by_hash(&hashes))
            .await?;
        let mut missing = Vec::with_capacity(pending.len() - found.len().min(pending.len()));
        for (seed, node) in pending {
            match found.get(&node.hash) {
                Some(&handle) => {
                    self.metrics.record_reused(NodeKind::Leaf, 1);
                    self.cache_put(node.hash, handle);
                    resolved.insert(seed, handle);
                }
                None => missing.push((seed, node)),
            }
        }
        Ok(missing)
    }

    /// Run one backend call under the limiter, after checking for cancellation.
    async fn round_trip<T, F>(&self, token: &CancelToken, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        token.check()?;
        let call = async {
            self.metrics.record_round_trip();
            call.await
        };
        match &self.limiter {
            Some(limiter) => limiter.run(token, call).await?,
            None => call.await,
        }
    }

    fn cache_get(&self, hash: &ContentHash) -> Option<NodeHandle> {
        let cache = self.cache.as_ref()?;
        let hit = cache.get(hash);
        match hit {
            Some(_) => self.metrics.record_cache(1, 0),
            None => self.metrics.record_cache(0, 1),
        }
        hit
    }

    fn cache_put(&self, hash: ContentHash, handle: NodeHandle) {
        if let Some(cache) = &self.cache {
            cache.insert(hash, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::BoundedCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use strata_runtime::{new_cancel_pair, CancelReason};

    /// Simulates a concurrent writer: the next `races` inserts first land the row through the
    /// inner backend, then report a unique violation.
    struct RacingBackend {
        inner: MemoryBackend,
        races: AtomicU32,
    }

    impl RacingBackend {
        fn new(races: u32) -> Self {
            Self {
                inner: MemoryBackend::new(),
                races: AtomicU32::new(races),
            }
        }

        fn take_race(&self) -> bool {
            self.races
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl NodeBackend for RacingBackend {
        async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<NodeHandle>> {
            self.inner.find_by_hash(hash).await
        }
        async fn find_many_by_hash(
            &self,
            hashes: &[ContentHash],
        ) -> Result<HashMap<ContentHash, NodeHandle>> {
            self.inner.find_many_by_hash(hashes).await
        }
        async fn insert(&self, node: NewNode) -> Result<NodeHandle> {
            if self.take_race() {
                let hash = node.hash;
                self.inner.insert(node).await?;
                return Err(StoreError::UniqueViolation { hash });
            }
            self.inner.insert(node).await
        }
        async fn batch_insert(&self, nodes: Vec<NewNode>) -> Result<Vec<NodeHandle>> {
            if self.take_race() {
                let first = nodes[0].clone();
                let hash = first.hash;
                self.inner.insert(first).await?;
                return Err(StoreError::UniqueViolation { hash });
            }
            self.inner.batch_insert(nodes).await
        }
        async fn fetch(&self, refs: &[NodeRef]) -> Result<Vec<NodeRow>> {
            self.inner.fetch(refs).await
        }
        async fn range_scan(
            &self,
            range: RangeInclusive<LocalityKey>,
        ) -> Result<BoxStream<'static, Result<NodeRow>>> {
            self.inner.range_scan(range).await
        }
        async fn count(&self, kind: NodeKind) -> Result<usize> {
            self.inner.count(kind).await
        }
    }

    /// Reports a duplicate for every insert but never returns the row.
    struct PhantomBackend;

    #[async_trait]
    impl NodeBackend for PhantomBackend {
        async fn find_by_hash(&self, _hash: &ContentHash) -> Result<Option<NodeHandle>> {
            Ok(None)
        }
        async fn find_many_by_hash(
            &self,
            _hashes: &[ContentHash],
        ) -> Result<HashMap<ContentHash, NodeHandle>> {
            Ok(HashMap::new())
        }
        async fn insert(&self, node: NewNode) -> Result<NodeHandle> {
            Err(StoreError::UniqueViolation { hash: node.hash })
        }
        async fn batch_insert(&self, nodes: Vec<NewNode>) -> Result<Vec<NodeHandle>> {
            Err(StoreError::UniqueViolation {
                hash: nodes[0].hash,
            })
        }
        async fn fetch(&self, _refs: &[NodeRef]) -> Result<Vec<NodeRow>> {
            Ok(Vec::new())
        }
        async fn range_scan(
            &self,
            _range: RangeInclusive<LocalityKey>,
        ) -> Result<BoxStream<'static, Result<NodeRow>>> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn count(&self, _kind: NodeKind) -> Result<usize> {
            Ok(0)
        }
    }

    fn memory_store() -> NodeStore<MemoryBackend> {
        NodeStore::new(Arc::new(MemoryBackend::new()))
    }

    fn seeds(s: &str) -> BTreeSet<Seed> {
        s.chars().map(Seed::unicode).collect()
    }

    #[tokio::test]
    async fn test_leaf_created_then_reused() {
        let store = memory_store();
        let token = CancelToken::default();
        let first = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap();
        let second = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap();
        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.handle(), second.handle());
        let m = store.metrics();
        assert_eq!(m.leaves_created, 1);
        assert_eq!(m.leaves_reused, 1);
    }

    #[tokio::test]
    async fn test_composite_validation_skips_backend() {
        let store = memory_store();
        let token = CancelToken::default();
        let err = store.get_or_create_composite(&[], &token).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let a = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap();
        let trips = store.metrics().round_trips;
        let err = store
            .get_or_create_composite(&[(a.handle(), 0)], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.metrics().round_trips, trips);
    }

    #[tokio::test]
    async fn test_equivalent_child_lists_share_a_row() {
        let store = memory_store();
        let token = CancelToken::default();
        let a = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap().handle();
        let b = store.get_or_create_leaf(Seed::unicode('b'), &token).await.unwrap().handle();
        let split = store
            .get_or_create_composite(&[(a, 1), (a, 1), (b, 1)], &token)
            .await
            .unwrap();
        let merged = store
            .get_or_create_composite(&[(a, 2), (b, 1)], &token)
            .await
            .unwrap();
        assert!(split.was_created());
        assert_eq!(merged, GetOrCreate::AlreadyExists(split.handle()));
        assert_eq!(store.count(NodeKind::Composite, &token).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_composite_point_is_weighted_centroid() {
        let store = memory_store();
        let token = CancelToken::default();
        let a = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap().handle();
        let aa = store
            .get_or_create_composite(&[(a, 2)], &token)
            .await
            .unwrap()
            .handle();
        assert_eq!(aa.point, a.point);
    }

    #[tokio::test]
    async fn test_insert_race_is_absorbed() {
        let store = NodeStore::new(Arc::new(RacingBackend::new(1)));
        let token = CancelToken::default();
        let outcome = store.get_or_create_leaf(Seed::unicode('q'), &token).await.unwrap();
        assert!(matches!(outcome, GetOrCreate::AlreadyExists(_)));
        assert_eq!(store.metrics().races_absorbed, 1);
        assert_eq!(store.count(NodeKind::Leaf, &token).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_phantom_duplicate_is_unresolved() {
        let store = NodeStore::new(Arc::new(PhantomBackend))
            .with_config(NodeStoreConfig { max_insert_attempts: 2 });
        let err = store
            .get_or_create_leaf(Seed::unicode('z'), &CancelToken::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unresolved { attempts: 2, .. }));
        assert_eq!(store.metrics().races_absorbed, 2);
    }

    #[tokio::test]
    async fn test_bulk_leaves_mix_existing_and_new() {
        let store = memory_store();
        let token = CancelToken::default();
        store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap();
        let before = store.metrics().round_trips;
        let map = store.bulk_get_or_create_leaves(&seeds("abc"), &token).await.unwrap();
        assert_eq!(map.len(), 3);
        // one lookup plus one batch insert
        assert_eq!(store.metrics().round_trips - before, 2);
        let m = store.metrics();
        assert_eq!(m.leaves_created, 3);
        assert_eq!(m.leaves_reused, 1);

        let again = store.bulk_get_or_create_leaves(&seeds("cab"), &token).await.unwrap();
        assert_eq!(again, map);
        assert_eq!(store.count(NodeKind::Leaf, &token).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_bulk_leaves_race_requeries_missing_set() {
        let store = NodeStore::new(Arc::new(RacingBackend::new(1)));
        let token = CancelToken::default();
        let map = store.bulk_get_or_create_leaves(&seeds("xyz"), &token).await.unwrap();
        assert_eq!(map.len(), 3);
        let m = store.metrics();
        assert_eq!(m.races_absorbed, 1);
        // The raced row is reused; only the rows of the retried batch count as created.
        assert_eq!(m.leaves_reused, 1);
        assert_eq!(m.leaves_created, 2);
        assert_eq!(store.count(NodeKind::Leaf, &token).await.unwrap(), 3);
        let distinct: BTreeSet<NodeRef> = map.values().map(|h| h.node).collect();
        assert_eq!(distinct.len(), 3);
    }

    #[tokio::test]
    async fn test_bulk_leaves_empty_set() {
        let store = memory_store();
        let map = store
            .bulk_get_or_create_leaves(&BTreeSet::new(), &CancelToken::default())
            .await
            .unwrap();
        assert!(map.is_empty());
        assert_eq!(store.metrics().round_trips, 0);
    }

    #[tokio::test]
    async fn test_cache_short_circuits_backend() {
        let cache = Arc::new(BoundedCache::new(128, 0.25));
        let store = memory_store().with_cache(cache.clone());
        let token = CancelToken::default();
        store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap();
        let trips = store.metrics().round_trips;
        let again = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap();
        assert!(!again.was_created());
        assert_eq!(store.metrics().round_trips, trips);
        assert_eq!(store.metrics().cache_hits, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_issues_no_round_trip() {
        let store = memory_store();
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Shutdown);
        let err = store.get_or_create_leaf(Seed::unicode('a'), &token).await.unwrap_err();
        assert!(matches!(err, StoreError::Cancelled(CancelReason::Shutdown)));
        assert_eq!(store.metrics().round_trips, 0);
    }

    #[tokio::test]
    async fn test_limiter_bounds_backend_calls() {
        let limiter = AsyncLimiter::new(2);
        let store = memory_store().with_limiter(limiter.clone());
        let mut tasks = Vec::new();
        for c in 'a'..='p' {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .get_or_create_leaf(Seed::unicode(c), &CancelToken::default())
                    .await
                    .unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let stats = limiter.stats();
        assert!(stats.peak_in_flight <= 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.acquired, store.metrics().round_trips);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_limiter_skips_round_trip() {
        let limiter = AsyncLimiter::new(1);
        let store = memory_store().with_limiter(limiter.clone());
        let held = limiter.acquire(&CancelToken::default()).await.unwrap();
        let (token, handle) = new_cancel_pair();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_create_leaf(Seed::unicode('a'), &token).await })
        };
        tokio::task::yield_now().await;
        handle.cancel(CancelReason::UserRequested);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Cancelled(CancelReason::UserRequested)));
        assert_eq!(store.metrics().round_trips, 0);
        drop(held);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = memory_store();
        let err = store
            .get(NodeRef::composite(5), &CancelToken::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { node } if node == NodeRef::composite(5)));
    }
}
