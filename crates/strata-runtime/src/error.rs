//! Error types for the strata-runtime subsystem

use thiserror::Error;

use crate::cancel::{CancelReason, CancelledError};

/// Errors raised by the runtime primitives.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The operation observed a cancellation signal before completing.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// The batch function returned a different number of outputs than it was given inputs.
    /// Every caller in the offending batch receives this error.
    #[error("batch contract violated: {got} outputs for {expected} inputs")]
    ContractViolation {
        /// Number of inputs handed to the batch function.
        expected: usize,
        /// Number of outputs it returned.
        got: usize,
    },

    /// The batch function itself returned an error.
    #[error("batch function failed: {0}")]
    BatchFailed(String),

    /// The named component has shut down and no longer accepts work.
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl From<CancelledError> for RuntimeError {
    fn from(err: CancelledError) -> Self {
        RuntimeError::Cancelled(err.0)
    }
}

impl RuntimeError {
    /// True if this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled(_))
    }
}

/// Result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
