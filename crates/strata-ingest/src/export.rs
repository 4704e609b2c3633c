//! Bit-exact reconstruction of symbol sequences from stored nodes.
//!
//! Rows are loaded one level at a time (one batched fetch per level of the DAG), then expanded
//! with an explicit post-order stack, so depth is never limited by the call stack. Expansions of
//! composites are memoised across calls; nodes are immutable, so the memo never needs
//! invalidation, only eviction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use strata_runtime::CancelToken;
use strata_store::{BoundedCache, CacheStats, NodeBackend, NodeBody, NodeRef, NodeStore};
use tracing::{debug, instrument};

use crate::error::{IngestError, Result};
use crate::symbols::symbols_to_text;

/// Export tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    /// Maximum memoised composite expansions. Counts entries, not symbols.
    pub memo_capacity: usize,
    /// Fraction of the memo dropped when it is full
    pub memo_evict_fraction: f64,
    /// Longest expansion, in symbols, that is memoised. Longer ones are rebuilt on each call
    /// from their memoised descendants.
    pub memo_max_symbols: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            memo_capacity: 65_536,
            memo_evict_fraction: 0.25,
            memo_max_symbols: 4096,
        }
    }
}

/// Outcome of a round-trip check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTrip {
    /// Export equals the original exactly
    pub matches: bool,
    /// First index where the sequences differ (or the shorter length if one is a prefix)
    pub first_mismatch: Option<usize>,
    /// Length of the exported sequence
    pub exported_len: usize,
}

/// Shared, immutable terminal sequence of one node.
pub type Expansion = Arc<[u32]>;

/// Reconstructs terminal sequences from a [`NodeStore`]. Cloning shares the memo.
pub struct ExportEngine<B: NodeBackend> {
    store: NodeStore<B>,
    memo: Arc<BoundedCache<NodeRef, Expansion>>,
    memo_max_symbols: usize,
}

impl<B: NodeBackend> Clone for ExportEngine<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            memo: self.memo.clone(),
            memo_max_symbols: self.memo_max_symbols,
        }
    }
}

impl<B: NodeBackend> ExportEngine<B> {
    /// Create an engine reading from `store`.
    pub fn new(store: NodeStore<B>, config: ExportConfig) -> Self {
        Self {
            store,
            memo: Arc::new(BoundedCache::new(
                config.memo_capacity,
                config.memo_evict_fraction,
            )),
            memo_max_symbols: config.memo_max_symbols,
        }
    }

    /// Memo counters.
    pub fn memo_stats(&self) -> CacheStats {
        self.memo.stats()
    }

    /// Drop every memoised expansion.
    pub fn clear_memo(&self) {
        self.memo.clear();
    }

    /// Reconstruct the terminal sequence of `root`.
    #[instrument(skip(self, token))]
    pub async fn export(&self, root: NodeRef, token: &CancelToken) -> Result<Vec<u32>> {
        Ok(self.expansion(root, token).await?.to_vec())
    }

    /// Reconstruct `root` as text.
    pub async fn export_text(&self, root: NodeRef, token: &CancelToken) -> Result<String> {
        let symbols = self.expansion(root, token).await?;
        symbols_to_text(&symbols)
    }

    /// Compare the export of `root` with `original`.
    pub async fn verify_roundtrip(
        &self,
        root: NodeRef,
        original: &[u32],
        token: &CancelToken,
    ) -> Result<RoundTrip> {
        let exported = self.expansion(root, token).await?;
        let first_mismatch = exported
            .iter()
            .zip(original)
            .position(|(a, b)| a != b)
            .or_else(|| {
                (exported.len() != original.len()).then(|| exported.len().min(original.len()))
            });
        Ok(RoundTrip {
            matches: first_mismatch.is_none(),
            first_mismatch,
            exported_len: exported.len(),
        })
    }

    /// Stream the expansion of each top-level relation of `root`, repeated by multiplicity.
    /// A leaf root yields its single symbol once.
    pub async fn export_stream(
        &self,
        root: NodeRef,
        token: &CancelToken,
    ) -> Result<BoxStream<'static, Result<Expansion>>>
    where
        B: 'static,
    {
        let row = self.store.get(root, token).await?;
        let relations = match row.body {
            NodeBody::Leaf(seed) => {
                let single: Expansion = Arc::from(vec![seed.value]);
                return Ok(stream::once(async move { Ok(single) }).boxed());
            }
            NodeBody::Composite(relations) => relations,
        };
        let engine = self.clone();
        let token = token.clone();
        let parts = stream::iter(relations)
            .then(move |relation| {
                let engine = engine.clone();
                let token = token.clone();
                async move {
                    let part = engine.expansion(relation.child, &token).await?;
                    Ok::<_, IngestError>((part, relation.multiplicity))
                }
            })
            .flat_map(|result| match result {
                Ok((part, multiplicity)) => {
                    stream::iter((0..multiplicity).map(move |_| Ok(part.clone()))).boxed()
                }
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            });
        Ok(parts.boxed())
    }

    async fn expansion(&self, root: NodeRef, token: &CancelToken) -> Result<Expansion> {
        if let Some(hit) = self.memo.get(&root) {
            return Ok(hit);
        }
        let (rows, mut done) = self.load(root, token).await?;
        self.expand(root, &rows, &mut done)
    }

    /// Fetch every row reachable from `root` that is not memoised, one batch per level.
    /// Memo hits are captured in the returned map so later eviction cannot lose them.
    async fn load(
        &self,
        root: NodeRef,
        token: &CancelToken,
    ) -> Result<(HashMap<NodeRef, NodeBody>, HashMap<NodeRef, Expansion>)> {
        let mut rows = HashMap::new();
        let mut done = HashMap::new();
        let mut seen = HashSet::from([root]);
        let mut frontier = vec![root];
        let mut level = 0u32;
        while !frontier.is_empty() {
            token.check()?;
            let fetched = self.store.fetch(&frontier, token).await?;
            if fetched.len() != frontier.len() {
                let present: HashSet<NodeRef> = fetched.iter().map(|row| row.node).collect();
                if let Some(&node) = frontier.iter().find(|node| !present.contains(node)) {
                    return Err(IngestError::NotFound { node });
                }
            }
            debug!(level, rows = fetched.len(), "export level loaded");
            let mut next = Vec::new();
            for row in fetched {
                if let NodeBody::Composite(relations) = &row.body {
                    for relation in relations {
                        let child = relation.child;
                        if !seen.insert(child) {
                            continue;
                        }
                        match self.memo.get(&child) {
                            Some(hit) => {
                                done.insert(child, hit);
                            }
                            None => next.push(child),
                        }
                    }
                }
                rows.insert(row.node, row.body);
            }
            frontier = next;
            level += 1;
        }
        Ok((rows, done))
    }

    fn expand(
        &self,
        root: NodeRef,
        rows: &HashMap<NodeRef, NodeBody>,
        done: &mut HashMap<NodeRef, Expansion>,
    ) -> Result<Expansion> {
        let mut stack = vec![(root, false)];
        while let Some((node, children_ready)) = stack.pop() {
            if done.contains_key(&node) {
                continue;
            }
            let body = rows.get(&node).ok_or(IngestError::NotFound { node })?;
            match body {
                NodeBody::Leaf(seed) => {
                    done.insert(node, Arc::from(vec![seed.value]));
                }
                NodeBody::Composite(relations) if children_ready => {
                    let mut out = Vec::new();
                    for relation in relations {
                        let part = done
                            .get(&relation.child)
                            .ok_or(IngestError::NotFound {
                                node: relation.child,
                            })?;
                        for _ in 0..relation.multiplicity {
                            out.extend_from_slice(part);
                        }
                    }
                    let expansion: Expansion = out.into();
                    if expansion.len() <= self.memo_max_symbols {
                        self.memo.insert(node, expansion.clone());
                    }
                    done.insert(node, expansion);
                }
                NodeBody::Composite(relations) => {
                    stack.push((node, true));
                    for relation in relations.iter().rev() {
                        if !done.contains_key(&relation.child) {
                            stack.push((relation.child, false));
                        }
                    }
                }
            }
        }
        done.get(&root)
            .cloned()
            .ok_or(IngestError::NotFound { node: root })
    }
}
