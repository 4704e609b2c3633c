//! Concurrent ingestion of many inputs against one shared store.
//!
//! All jobs share a [`NodeStore`] carrying a bounded hash cache and a backend limiter. Leaf
//! requests from concurrent jobs are coalesced by a [`BatchProcessor`] into bulk
//! get-or-create calls, and inducer arenas are recycled through an [`ObjectPool`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use strata_runtime::{
    AsyncLimiter, BatchConfig, BatchProcessor, BatchStatsSnapshot, CancelHandle, CancelReason,
    CancelToken, LimiterStats, ObjectPool, PoolConfig, PoolStats,
};
use strata_store::{
    CacheStats, HashCache, NodeBackend, NodeHandle, NodeStore, Seed, SeedKind, StoreError,
    StoreMetricsSnapshot,
};
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::grammar::{Arena, InducerConfig};
use crate::pipeline::{IngestOutcome, IngestionPipeline, LeafSource};
use crate::symbols::text_symbols;

/// Tuning for [`ParallelIngestor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParallelConfig {
    /// Concurrent backend calls across all jobs
    pub max_concurrency: usize,
    /// Concurrent ingestion jobs
    pub max_jobs: usize,
    /// Hash cache entries
    pub cache_capacity: usize,
    /// Fraction of the hash cache dropped when it is full
    pub cache_evict_fraction: f64,
    /// Leaf requests per bulk call
    pub batch_size: usize,
    /// Longest wait for a leaf batch to fill, in milliseconds
    pub batch_timeout_ms: u64,
    /// Pending leaf requests before submitters wait
    pub queue_capacity: usize,
    /// Idle inducer arenas kept for reuse
    pub arena_pool_size: usize,
    /// Cell slots an idle arena may keep allocated
    pub arena_retain_cells: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_jobs: 16,
            cache_capacity: 100_000,
            cache_evict_fraction: 0.25,
            batch_size: 256,
            batch_timeout_ms: 2,
            queue_capacity: 4096,
            arena_pool_size: 8,
            arena_retain_cells: 65_536,
        }
    }
}

impl ParallelConfig {
    fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            queue_capacity: self.queue_capacity,
        }
    }
}

/// Point-in-time view of every shared component.
#[derive(Debug, Clone)]
pub struct ParallelStats {
    /// Node store counters
    pub store: StoreMetricsSnapshot,
    /// Hash cache counters
    pub cache: Option<CacheStats>,
    /// Leaf batching counters
    pub batches: BatchStatsSnapshot,
    /// Arena pool counters
    pub arenas: PoolStats,
    /// Job limiter usage
    pub jobs: LimiterStats,
    /// Backend limiter usage
    pub backend: Option<LimiterStats>,
}

/// Coalesces leaf requests from concurrent jobs.
struct BatchedLeaves {
    batcher: BatchProcessor<Seed, NodeHandle>,
}

impl BatchedLeaves {
    fn start<B: NodeBackend + 'static>(store: NodeStore<B>, config: BatchConfig) -> Self {
        let batcher = BatchProcessor::start(config, move |seeds: Vec<Seed>| {
            let store = store.clone();
            async move {
                let distinct: BTreeSet<Seed> = seeds.iter().copied().collect();
                let resolved = store
                    .bulk_get_or_create_leaves(&distinct, &CancelToken::default())
                    .await?;
                debug!(requests = seeds.len(), distinct = distinct.len(), "leaf batch resolved");
                seeds
                    .iter()
                    .map(|seed| {
                        resolved.get(seed).copied().ok_or_else(|| {
                            StoreError::Backend(format!("bulk result is missing {:?}", seed))
                        })
                    })
                    .collect::<std::result::Result<Vec<_>, StoreError>>()
            }
        });
        Self { batcher }
    }
}

#[async_trait]
impl LeafSource for BatchedLeaves {
    async fn leaves(
        &self,
        seeds: &BTreeSet<Seed>,
        token: &CancelToken,
    ) -> Result<HashMap<Seed, NodeHandle>> {
        let requests = seeds.iter().map(|&seed| async move {
            let handle = self.batcher.submit_with_cancel(seed, token).await?;
            Ok::<_, IngestError>((seed, handle))
        });
        Ok(try_join_all(requests).await?.into_iter().collect())
    }
}

/// Cancels the jobs of an abandoned call.
struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel(CancelReason::UserRequested);
    }
}

struct Shared<B: NodeBackend> {
    pipeline: IngestionPipeline<B>,
    leaves: BatchedLeaves,
    arenas: ObjectPool<Arena>,
    jobs: AsyncLimiter,
}

/// Runs many ingestions concurrently over one store. Cloning shares everything.
pub struct ParallelIngestor<B: NodeBackend + 'static> {
    shared: Arc<Shared<B>>,
}

impl<B: NodeBackend + 'static> Clone for ParallelIngestor<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: NodeBackend + 'static> ParallelIngestor<B> {
    /// Build a store over `backend` with a hash cache and backend limiter sized by `config`.
    /// Must be called from within a tokio runtime.
    pub fn new(backend: Arc<B>, inducer: InducerConfig, config: ParallelConfig) -> Self {
        let store = NodeStore::new(backend)
            .with_cache(Arc::new(HashCache::new(
                config.cache_capacity,
                config.cache_evict_fraction,
            )))
            .with_limiter(AsyncLimiter::new(config.max_concurrency));
        Self::with_store(store, inducer, config)
    }

    /// Use an already configured store. `config`'s cache and concurrency fields are ignored.
    /// Must be called from within a tokio runtime.
    pub fn with_store(store: NodeStore<B>, inducer: InducerConfig, config: ParallelConfig) -> Self {
        let leaves = BatchedLeaves::start(store.clone(), config.batch_config());
        let retain_cells = config.arena_retain_cells;
        let arenas = ObjectPool::with_reset(
            PoolConfig {
                max_idle: config.arena_pool_size,
            },
            Arena::new,
            move |arena: &mut Arena| arena.reset(retain_cells),
        );
        Self {
            shared: Arc::new(Shared {
                pipeline: IngestionPipeline::new(store, inducer),
                leaves,
                arenas,
                jobs: AsyncLimiter::new(config.max_jobs),
            }),
        }
    }

    /// Interpret terminals as `kind` seeds. Only valid before the ingestor is cloned.
    pub fn with_seed_kind(self, kind: SeedKind) -> Result<Self> {
        let shared = Arc::try_unwrap(self.shared).map_err(|_| {
            IngestError::Validation("seed kind must be set before the ingestor is shared".into())
        })?;
        Ok(Self {
            shared: Arc::new(Shared {
                pipeline: shared.pipeline.with_seed_kind(kind),
                ..shared
            }),
        })
    }

    /// The shared store.
    pub fn store(&self) -> &NodeStore<B> {
        self.shared.pipeline.store()
    }

    /// Ingest one text under the job limiter.
    pub async fn ingest_text(&self, text: &str, token: &CancelToken) -> Result<IngestOutcome> {
        self.run_job(text_symbols(text), token).await
    }

    /// Ingest every text concurrently, one task each. Results come back in input order; one
    /// job's failure does not affect the others.
    pub async fn ingest_many(
        &self,
        texts: Vec<String>,
        token: &CancelToken,
    ) -> Vec<Result<IngestOutcome>> {
        let inputs = texts.iter().map(|t| text_symbols(t)).collect();
        self.ingest_many_symbols(inputs, token).await
    }

    /// Ingest every symbol sequence concurrently, one task each, in input order.
    ///
    /// Dropping the returned future cancels jobs that have not finished.
    pub async fn ingest_many_symbols(
        &self,
        inputs: Vec<Vec<i64>>,
        token: &CancelToken,
    ) -> Vec<Result<IngestOutcome>> {
        let total = inputs.len();
        let (scope, handle) = token.child();
        let _guard = CancelOnDrop(handle);
        let tasks: Vec<_> = inputs
            .into_iter()
            .map(|symbols| {
                let this = self.clone();
                let token = scope.clone();
                tokio::spawn(async move { this.run_job(symbols, &token).await })
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        for (index, task) in tasks.into_iter().enumerate() {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(IngestError::Join(e.to_string())),
            };
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    warn!(index, error = %e, "ingestion job failed");
                }
            }
            results.push(result);
        }
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(total, failed, "parallel ingestion complete");
        results
    }

    /// Snapshot of shared component counters.
    pub fn stats(&self) -> ParallelStats {
        let store = self.store();
        ParallelStats {
            store: store.metrics(),
            cache: store.cache().map(|c| c.stats()),
            batches: self.shared.leaves.batcher.stats(),
            arenas: self.shared.arenas.stats(),
            jobs: self.shared.jobs.stats(),
            backend: store.limiter().map(|l| l.stats()),
        }
    }

    async fn run_job(&self, symbols: Vec<i64>, token: &CancelToken) -> Result<IngestOutcome> {
        let _permit = self.shared.jobs.acquire(token).await?;
        let mut arena = self.shared.arenas.get();
        let pipeline = &self.shared.pipeline;
        pipeline
            .ingest_with(
                &symbols,
                pipeline.seed_kind(),
                &mut arena,
                &self.shared.leaves,
                token,
            )
            .await
    }
}
