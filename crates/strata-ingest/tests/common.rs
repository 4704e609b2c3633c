//! Common test utilities and fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use strata_ingest::{ExportConfig, ExportEngine, InducerConfig, IngestionPipeline};
use strata_runtime::CancelToken;
use strata_store::{
    ContentHash, LocalityKey, MemoryBackend, NewNode, NodeBackend, NodeHandle, NodeKind, NodeRef,
    NodeRow, NodeStore, StoreError,
};

type StoreResult<T> = strata_store::Result<T>;

/// Backend that loses the first `races` inserts to a simulated concurrent writer: the row is
/// written through the inner backend, then a unique violation is reported.
pub struct RacingBackend {
    inner: MemoryBackend,
    races: AtomicU32,
    lost: AtomicU32,
}

impl RacingBackend {
    pub fn new(races: u32) -> Self {
        Self {
            inner: MemoryBackend::new(),
            races: AtomicU32::new(races),
            lost: AtomicU32::new(0),
        }
    }

    /// Inserts that were reported as lost races.
    pub fn races_lost(&self) -> u32 {
        self.lost.load(Ordering::Acquire)
    }

    fn take_race(&self) -> bool {
        let raced = self
            .races
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .is_ok();
        if raced {
            self.lost.fetch_add(1, Ordering::AcqRel);
        }
        raced
    }
}

#[async_trait]
impl NodeBackend for RacingBackend {
    async fn find_by_hash(&self, hash: &ContentHash) -> StoreResult<Option<NodeHandle>> {
        self.inner.find_by_hash(hash).await
    }

    async fn find_many_by_hash(
        &self,
        hashes: &[ContentHash],
    ) -> StoreResult<HashMap<ContentHash, NodeHandle>> {
        self.inner.find_many_by_hash(hashes).await
    }

    async fn insert(&self, node: NewNode) -> StoreResult<NodeHandle> {
        if self.take_race() {
            let hash = node.hash;
            self.inner.insert(node).await?;
            return Err(StoreError::UniqueViolation { hash });
        }
        self.inner.insert(node).await
    }

    async fn batch_insert(&self, nodes: Vec<NewNode>) -> StoreResult<Vec<NodeHandle>> {
        if let Some(first) = nodes.first() {
            if self.take_race() {
                let hash = first.hash;
                self.inner.insert(first.clone()).await?;
                return Err(StoreError::UniqueViolation { hash });
            }
        }
        self.inner.batch_insert(nodes).await
    }

    async fn fetch(&self, refs: &[NodeRef]) -> StoreResult<Vec<NodeRow>> {
        self.inner.fetch(refs).await
    }

    async fn range_scan(
        &self,
        range: RangeInclusive<LocalityKey>,
    ) -> StoreResult<BoxStream<'static, StoreResult<NodeRow>>> {
        self.inner.range_scan(range).await
    }

    async fn count(&self, kind: NodeKind) -> StoreResult<usize> {
        self.inner.count(kind).await
    }
}

/// Serial pipeline and export engine over one fresh in-memory store.
pub fn memory_harness() -> (IngestionPipeline<MemoryBackend>, ExportEngine<MemoryBackend>) {
    harness(Arc::new(MemoryBackend::new()))
}

/// Serial pipeline and export engine over `backend`.
pub fn harness<B: NodeBackend>(backend: Arc<B>) -> (IngestionPipeline<B>, ExportEngine<B>) {
    let store = NodeStore::new(backend);
    let engine = ExportEngine::new(store.clone(), ExportConfig::default());
    (IngestionPipeline::new(store, InducerConfig::default()), engine)
}

/// Ingest `text` and export it back.
pub async fn round_trip<B: NodeBackend>(
    pipeline: &IngestionPipeline<B>,
    engine: &ExportEngine<B>,
    text: &str,
) -> String {
    let token = CancelToken::default();
    let outcome = pipeline.ingest_text(text, &token).await.unwrap();
    engine.export_text(outcome.root, &token).await.unwrap()
}

/// Text symbols as exported terminals.
pub fn terminals(text: &str) -> Vec<u32> {
    text.chars().map(|c| c as u32).collect()
}
