//! Serial ingestion: symbols → leaves → grammar → composites → root.
//!
//! 1. Validate and extract terminals (no store access on bad input)
//! 2. Resolve every distinct terminal to a leaf in one bulk call
//! 3. Induce the grammar in memory
//! 4. Persist rules tier by tier as two-child composites
//! 5. Run-length compress the final sequence into the root composite

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_runtime::CancelToken;
use strata_store::{run_length_encode, NodeBackend, NodeHandle, NodeRef, NodeStore, Seed, SeedKind, StoreError};
use tracing::{debug, info, instrument};

use crate::error::{IngestError, Result};
use crate::grammar::{Arena, GrammarInducer, InducerConfig, Induction};
use crate::symbols::{
    float_symbols, integer_symbols, terminal_seed, text_symbols, utf16_symbols,
};

/// Resolves terminal seeds to leaf nodes.
#[async_trait]
pub trait LeafSource: Send + Sync {
    /// Get or create a leaf for every seed.
    async fn leaves(
        &self,
        seeds: &BTreeSet<Seed>,
        token: &CancelToken,
    ) -> Result<HashMap<Seed, NodeHandle>>;
}

#[async_trait]
impl<B: NodeBackend> LeafSource for NodeStore<B> {
    async fn leaves(
        &self,
        seeds: &BTreeSet<Seed>,
        token: &CancelToken,
    ) -> Result<HashMap<Seed, NodeHandle>> {
        Ok(self.bulk_get_or_create_leaves(seeds, token).await?)
    }
}

/// Induction statistics for one ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Terminals in the input
    pub terminal_count: usize,
    /// Distinct terminals in the input
    pub unique_terminals: usize,
    /// Rules induced
    pub rule_count: usize,
    /// Tiers that produced a rule
    pub tier_count: u32,
    /// Length of the rewritten top-level sequence
    pub final_length: usize,
    /// `terminal_count / final_length`
    pub compression_ratio: f64,
}

/// Result of one ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    /// Node that reproduces the input when exported
    pub root: NodeRef,
    /// Induction statistics
    pub stats: IngestStats,
}

/// Serial ingestion pipeline over a [`NodeStore`].
pub struct IngestionPipeline<B: NodeBackend> {
    store: NodeStore<B>,
    inducer: GrammarInducer,
    seed_kind: SeedKind,
}

impl<B: NodeBackend> IngestionPipeline<B> {
    /// Create a pipeline writing to `store`. Terminals default to Unicode seeds.
    pub fn new(store: NodeStore<B>, config: InducerConfig) -> Self {
        Self {
            store,
            inducer: GrammarInducer::new(config),
            seed_kind: SeedKind::Unicode,
        }
    }

    /// Interpret terminals as `kind` seeds.
    pub fn with_seed_kind(mut self, kind: SeedKind) -> Self {
        self.seed_kind = kind;
        self
    }

    /// The store nodes are written to.
    pub fn store(&self) -> &NodeStore<B> {
        &self.store
    }

    /// Seed kind used for terminals.
    pub fn seed_kind(&self) -> SeedKind {
        self.seed_kind
    }

    /// Ingest a terminal sequence.
    #[instrument(skip(self, symbols, token), fields(symbols = symbols.len()))]
    pub async fn ingest(&self, symbols: &[i64], token: &CancelToken) -> Result<IngestOutcome> {
        self.ingest_as(symbols, self.seed_kind, token).await
    }

    /// Ingest raw integers as [`SeedKind::Integer`] terminals, whatever the configured kind.
    pub async fn ingest_integers(
        &self,
        values: &[u32],
        token: &CancelToken,
    ) -> Result<IngestOutcome> {
        self.ingest_as(&integer_symbols(values), SeedKind::Integer, token)
            .await
    }

    /// Ingest floats by bit pattern as [`SeedKind::FloatBits`] terminals.
    pub async fn ingest_floats(&self, values: &[f32], token: &CancelToken) -> Result<IngestOutcome> {
        self.ingest_as(&float_symbols(values), SeedKind::FloatBits, token)
            .await
    }

    async fn ingest_as(
        &self,
        symbols: &[i64],
        kind: SeedKind,
        token: &CancelToken,
    ) -> Result<IngestOutcome> {
        let mut arena = Arena::with_capacity(symbols.len());
        self.ingest_with(symbols, kind, &mut arena, &self.store, token)
            .await
    }

    /// Ingest text, one terminal per Unicode scalar value.
    pub async fn ingest_text(&self, text: &str, token: &CancelToken) -> Result<IngestOutcome> {
        self.ingest(&text_symbols(text), token).await
    }

    /// Ingest UTF-16 code units, combining surrogate pairs.
    pub async fn ingest_utf16(&self, units: &[u16], token: &CancelToken) -> Result<IngestOutcome> {
        let symbols = utf16_symbols(units)?;
        self.ingest(&symbols, token).await
    }

    /// Ingest using caller-provided scratch and leaf resolution.
    pub(crate) async fn ingest_with(
        &self,
        symbols: &[i64],
        kind: SeedKind,
        arena: &mut Arena,
        leaves: &dyn LeafSource,
        token: &CancelToken,
    ) -> Result<IngestOutcome> {
        if symbols.is_empty() {
            return Err(IngestError::Validation("cannot ingest empty input".into()));
        }
        let mut distinct = BTreeSet::new();
        for &symbol in symbols {
            distinct.insert(terminal_seed(symbol, kind)?);
        }
        token.check()?;

        let leaf_map = leaves.leaves(&distinct, token).await?;
        let mut nodes: HashMap<i64, NodeHandle> = HashMap::with_capacity(leaf_map.len());
        for (seed, handle) in &leaf_map {
            nodes.insert(seed.value as i64, *handle);
        }

        let induction = self.inducer.induce_with(symbols, arena, token)?;
        self.persist_rules(&induction, &mut nodes, token).await?;
        let root = self.persist_root(&induction, &nodes, token).await?;

        let final_length = induction.final_sequence.len();
        let stats = IngestStats {
            terminal_count: symbols.len(),
            unique_terminals: distinct.len(),
            rule_count: induction.rules.len(),
            tier_count: induction.tier_count(),
            final_length,
            compression_ratio: symbols.len() as f64 / final_length as f64,
        };
        info!(
            root = %root,
            terminals = stats.terminal_count,
            unique = stats.unique_terminals,
            rules = stats.rule_count,
            ratio = stats.compression_ratio,
            "ingestion complete"
        );
        Ok(IngestOutcome { root, stats })
    }

    async fn persist_rules(
        &self,
        induction: &Induction,
        nodes: &mut HashMap<i64, NodeHandle>,
        token: &CancelToken,
    ) -> Result<()> {
        for rule in &induction.rules {
            token.check()?;
            let left = lookup(nodes, rule.left)?;
            let right = lookup(nodes, rule.right)?;
            let outcome = self
                .store
                .get_or_create_composite(&[(left, 1), (right, 1)], token)
                .await
                .map_err(|source| match source {
                    StoreError::Cancelled(reason) => IngestError::Cancelled(reason),
                    source => IngestError::Persist {
                        tier: rule.tier,
                        rule_id: rule.rule_id,
                        source,
                    },
                })?;
            debug!(rule_id = rule.rule_id, tier = rule.tier, node = %outcome.node(), created = outcome.was_created(), "rule persisted");
            nodes.insert(rule.rule_id, outcome.handle());
        }
        Ok(())
    }

    async fn persist_root(
        &self,
        induction: &Induction,
        nodes: &HashMap<i64, NodeHandle>,
        token: &CancelToken,
    ) -> Result<NodeRef> {
        let runs = run_length_encode(&induction.final_sequence);
        if let [(symbol, 1)] = runs.as_slice() {
            return Ok(lookup(nodes, *symbol)?.node);
        }
        let mut children = Vec::with_capacity(runs.len());
        for (symbol, multiplicity) in runs {
            children.push((lookup(nodes, symbol)?, multiplicity));
        }
        token.check()?;
        let outcome = self.store.get_or_create_composite(&children, token).await?;
        Ok(outcome.node())
    }
}

fn lookup(nodes: &HashMap<i64, NodeHandle>, symbol: i64) -> Result<NodeHandle> {
    nodes.get(&symbol).copied().ok_or_else(|| {
        IngestError::Validation(format!("symbol {} has no node", symbol))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportConfig, ExportEngine};
    use strata_runtime::{new_cancel_pair, CancelReason};
    use strata_store::{MemoryBackend, NodeKind};
    use std::sync::Arc;

    fn pipeline() -> IngestionPipeline<MemoryBackend> {
        IngestionPipeline::new(
            NodeStore::new(Arc::new(MemoryBackend::new())),
            InducerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_input_rejected_without_writes() {
        let p = pipeline();
        let err = p.ingest_text("", &CancelToken::default()).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(p.store().metrics().round_trips, 0);
    }

    #[tokio::test]
    async fn test_single_symbol_root_is_leaf() {
        let p = pipeline();
        let out = p.ingest_text("x", &CancelToken::default()).await.unwrap();
        assert!(out.root.is_leaf());
        assert_eq!(out.stats.final_length, 1);
        assert_eq!(out.stats.compression_ratio, 1.0);
        let token = CancelToken::default();
        assert_eq!(p.store().count(NodeKind::Composite, &token).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_symbol_root_is_run() {
        let p = pipeline();
        let token = CancelToken::default();
        let out = p.ingest_text("xx", &token).await.unwrap();
        // "xx" induces no rule (one occurrence), so the root is x with multiplicity 2.
        assert_eq!(out.root.kind, NodeKind::Composite);
        assert_eq!(out.stats.rule_count, 0);
        let row = p.store().get(out.root, &token).await.unwrap();
        match row.body {
            strata_store::NodeBody::Composite(rel) => {
                assert_eq!(rel.len(), 1);
                assert_eq!(rel[0].multiplicity, 2);
                assert!(rel[0].child.is_leaf());
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_periodic_root_collapses_to_one_relation() {
        let p = pipeline();
        let out = p
            .ingest_text("abcabcabcabc", &CancelToken::default())
            .await
            .unwrap();
        assert_eq!(out.stats.rule_count, 3);
        assert_eq!(out.stats.tier_count, 3);
        assert_eq!(out.stats.final_length, 2);
        assert_eq!(out.stats.compression_ratio, 6.0);
        assert_eq!(out.stats.unique_terminals, 3);
        let token = CancelToken::default();
        // three rules plus the root
        assert_eq!(p.store().count(NodeKind::Composite, &token).await.unwrap(), 4);
        assert_eq!(p.store().count(NodeKind::Leaf, &token).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unicode_seed_rejects_surrogate_terminal() {
        let p = pipeline();
        let err = p.ingest(&[0x61, 0xD800], &CancelToken::default()).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(p.store().metrics().round_trips, 0);
    }

    #[tokio::test]
    async fn test_integer_seed_kind() {
        let p = pipeline().with_seed_kind(SeedKind::Integer);
        let out = p
            .ingest(&[7, 8, 7, 8, 7, 8], &CancelToken::default())
            .await
            .unwrap();
        assert!(out.stats.rule_count >= 1);
    }

    #[tokio::test]
    async fn test_integers_export_their_values() {
        let p = pipeline();
        let token = CancelToken::default();
        let values = [0, 70_000, u32::MAX, 0, 70_000, u32::MAX, 5];
        let out = p.ingest_integers(&values, &token).await.unwrap();
        assert!(out.stats.rule_count >= 1);
        let engine = ExportEngine::new(p.store().clone(), ExportConfig::default());
        assert_eq!(engine.export(out.root, &token).await.unwrap(), values);
    }

    #[tokio::test]
    async fn test_floats_keep_distinct_leaves_from_text() {
        let p = pipeline();
        let token = CancelToken::default();
        let values = [1.5f32, -0.0, f32::NAN, 1.5, -0.0];
        let out = p.ingest_floats(&values, &token).await.unwrap();
        let engine = ExportEngine::new(p.store().clone(), ExportConfig::default());
        let bits = engine.export(out.root, &token).await.unwrap();
        let expected: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, expected);
        assert!(f32::from_bits(bits[1]).is_sign_negative());

        // 'A' and the float whose bits are 0x41 share a value but not a seed kind.
        p.ingest_text("A", &token).await.unwrap();
        p.ingest_floats(&[f32::from_bits(0x41)], &token).await.unwrap();
        assert_eq!(p.store().count(NodeKind::Leaf, &token).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_before_store_access() {
        let p = pipeline();
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        let err = p.ingest_text("hello", &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(p.store().metrics().round_trips, 0);
    }

    #[tokio::test]
    async fn test_unpaired_surrogate_rejected() {
        let p = pipeline();
        let err = p
            .ingest_utf16(&[0x68, 0xDC00], &CancelToken::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }
}
