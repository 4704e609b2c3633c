#![warn(missing_docs)]

//! Strata runtime subsystem: concurrency primitives shared by the ingestion and export pipelines.
//!
//! - [`batch::BatchProcessor`] coalesces individual submissions into bounded batches
//! - [`pool::ObjectPool`] recycles expensive scratch objects
//! - [`limiter::AsyncLimiter`] caps concurrent access to a shared resource
//! - [`cancel::CancelToken`] carries cooperative cancellation through every suspension point

pub mod batch;
pub mod cancel;
pub mod error;
pub mod limiter;
pub mod pool;

pub use batch::{BatchConfig, BatchProcessor, BatchStats, BatchStatsSnapshot};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken, CancelledError};
pub use error::{Result, RuntimeError};
pub use limiter::{AsyncLimiter, LimiterPermit, LimiterStats};
pub use pool::{ObjectPool, PoolConfig, PoolStats, Pooled};
