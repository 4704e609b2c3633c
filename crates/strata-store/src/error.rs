//! Error types for the strata-store subsystem

use strata_runtime::{CancelReason, CancelledError, RuntimeError};

use crate::hash::ContentHash;
use crate::node::NodeRef;

/// All errors that can occur while creating or reading nodes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Input rejected before reaching the backend
    #[error("validation failed: {0}")]
    Validation(String),
    /// A referenced node does not exist in the backend
    #[error("node {node} not found")]
    NotFound {
        /// The dangling reference
        node: NodeRef,
    },
    /// The backend already holds a row with this content hash.
    /// Absorbed by [`NodeStore`](crate::NodeStore); callers of the store never see it.
    #[error("unique violation on content hash {hash}")]
    UniqueViolation {
        /// Hash that collided with an existing row
        hash: ContentHash,
    },
    /// The backend kept reporting a duplicate it could not return
    #[error("content hash {hash} unresolved after {attempts} attempts")]
    Unresolved {
        /// Hash being resolved
        hash: ContentHash,
        /// Find/insert rounds tried
        attempts: u32,
    },
    /// The operation was cancelled before the backend call was issued
    #[error("store operation cancelled: {0}")]
    Cancelled(CancelReason),
    /// Backend-specific failure
    #[error("backend error: {0}")]
    Backend(String),
    /// Row encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CancelledError> for StoreError {
    fn from(err: CancelledError) -> Self {
        StoreError::Cancelled(err.0)
    }
}

impl From<RuntimeError> for StoreError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled(reason) => StoreError::Cancelled(reason),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
