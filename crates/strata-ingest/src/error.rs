//! Error types for the strata-ingest subsystem

use strata_runtime::{CancelReason, CancelledError, RuntimeError};
use strata_store::{NodeRef, StoreError};

/// Errors raised by grammar induction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InduceError {
    /// Induction stopped at a tier boundary
    #[error("induction cancelled at tier {tier}: {reason}")]
    Cancelled {
        /// Tier that was about to start
        tier: u32,
        /// Why it stopped
        reason: CancelReason,
    },
    /// A negative symbol was given as input
    #[error("symbol {symbol} at index {index} is not a terminal")]
    NotTerminal {
        /// Offending symbol
        symbol: i64,
        /// Its position in the input
        index: usize,
    },
}

/// All errors that can occur while ingesting or exporting.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Input rejected before any node was written
    #[error("validation failed: {0}")]
    Validation(String),
    /// A referenced node is missing from the store
    #[error("node {node} not found")]
    NotFound {
        /// The dangling reference
        node: NodeRef,
    },
    /// The operation was cancelled
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),
    /// Grammar induction failed
    #[error("induction failed: {0}")]
    Induce(InduceError),
    /// Writing a rule's composite failed
    #[error("persisting rule {rule_id} (tier {tier}) failed: {source}")]
    Persist {
        /// Tier of the rule
        tier: u32,
        /// Rule symbol
        rule_id: i64,
        /// Underlying store failure
        #[source]
        source: StoreError,
    },
    /// Node store failure
    #[error("store error: {0}")]
    Store(StoreError),
    /// Runtime primitive failure (batching, pool, limiter)
    #[error("runtime error: {0}")]
    Runtime(RuntimeError),
    /// A spawned ingestion task panicked or was aborted
    #[error("ingestion task failed: {0}")]
    Join(String),
}

impl IngestError {
    /// True if this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            IngestError::Cancelled(_) => true,
            IngestError::Induce(InduceError::Cancelled { .. }) => true,
            IngestError::Persist { source, .. } => matches!(source, StoreError::Cancelled(_)),
            _ => false,
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled(reason) => IngestError::Cancelled(reason),
            StoreError::NotFound { node } => IngestError::NotFound { node },
            StoreError::Validation(msg) => IngestError::Validation(msg),
            other => IngestError::Store(other),
        }
    }
}

impl From<RuntimeError> for IngestError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled(reason) => IngestError::Cancelled(reason),
            other => IngestError::Runtime(other),
        }
    }
}

impl From<InduceError> for IngestError {
    fn from(err: InduceError) -> Self {
        match err {
            InduceError::NotTerminal { symbol, index } => IngestError::Validation(format!(
                "symbol {} at index {} is not a terminal",
                symbol, index
            )),
            other => IngestError::Induce(other),
        }
    }
}

impl From<CancelledError> for IngestError {
    fn from(err: CancelledError) -> Self {
        IngestError::Cancelled(err.0)
    }
}

/// Result alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;
