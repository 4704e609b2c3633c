//! Batch coalescing for store round trips.
//!
//! Many small, independent requests (one leaf lookup per distinct symbol per ingestion job) are
//! gathered into one call of a user-supplied batch function. A batch is released when
//! `batch_size` items are pending or when `batch_timeout` has elapsed since the first pending
//! item arrived. The submission queue is bounded: once full, `submit` waits instead of dropping
//! work or growing memory.
//!
//! The batch function must return exactly one output per input, in input order. A mismatch is a
//! contract violation that fails every caller in that batch.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, RuntimeError};

/// Configuration for batch collection behavior.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of items per batch.
    pub batch_size: usize,
    /// How long the first pending item may wait for company before the batch is released.
    pub batch_timeout: Duration,
    /// Capacity of the submission queue; submitters wait when it is full.
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            batch_size: 256,
            batch_timeout: Duration::from_millis(2),
            queue_capacity: 4096,
        }
    }
}

/// Statistics for batch operations.
pub struct BatchStats {
    batches_dispatched: AtomicU64,
    items_dispatched: AtomicU64,
    contract_violations: AtomicU64,
    batch_failures: AtomicU64,
}

impl BatchStats {
    /// Create a new batch stats instance.
    pub fn new() -> Self {
        BatchStats {
            batches_dispatched: AtomicU64::new(0),
            items_dispatched: AtomicU64::new(0),
            contract_violations: AtomicU64::new(0),
            batch_failures: AtomicU64::new(0),
        }
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> BatchStatsSnapshot {
        BatchStatsSnapshot {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            items_dispatched: self.items_dispatched.load(Ordering::Relaxed),
            contract_violations: self.contract_violations.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
        }
    }

    fn record_batch(&self, item_count: u64) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.items_dispatched.fetch_add(item_count, Ordering::Relaxed);
    }
}

impl Default for BatchStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of batch statistics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStatsSnapshot {
    /// Total number of batches handed to the batch function.
    pub batches_dispatched: u64,
    /// Total number of items across all dispatched batches.
    pub items_dispatched: u64,
    /// Batches whose output count did not match their input count.
    pub contract_violations: u64,
    /// Batches whose batch function returned an error.
    pub batch_failures: u64,
}

struct Pending<I, O> {
    input: I,
    reply: oneshot::Sender<Result<O>>,
    queued_at: Instant,
}

/// Coalesces individual submissions into batches processed by a single worker task.
pub struct BatchProcessor<I, O> {
    sender: mpsc::Sender<Pending<I, O>>,
    stats: Arc<BatchStats>,
    worker: JoinHandle<()>,
}

impl<I, O> BatchProcessor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Start the worker task. `batch_fn` is called once per released batch.
    pub fn start<F, Fut, E>(config: BatchConfig, batch_fn: F) -> Self
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<O>, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            queue_capacity: config.queue_capacity.max(1),
            ..config
        };
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let stats = Arc::new(BatchStats::new());
        let worker = tokio::spawn(run(receiver, config, batch_fn, stats.clone()));
        BatchProcessor {
            sender,
            stats,
            worker,
        }
    }

    /// Submit one input and wait for its output.
    ///
    /// Waits for queue space when the queue is full.
    pub async fn submit(&self, input: I) -> Result<O> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Pending {
                input,
                reply,
                queued_at: Instant::now(),
            })
            .await
            .map_err(|_| RuntimeError::Closed("batch processor"))?;
        response
            .await
            .map_err(|_| RuntimeError::Closed("batch processor"))?
    }

    /// Like [`submit`](Self::submit), but gives up while waiting if `token` is cancelled.
    ///
    /// Once an item has been dispatched as part of a batch, the batch runs to completion
    /// regardless; only this caller stops waiting for it.
    pub async fn submit_with_cancel(&self, input: I, token: &CancelToken) -> Result<O> {
        token.check()?;
        tokio::select! {
            biased;
            reason = token.cancelled() => Err(RuntimeError::Cancelled(reason)),
            out = self.submit(input) => out,
        }
    }

    /// Get a snapshot of current batch statistics.
    pub fn stats(&self) -> BatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Check if the worker is still accepting submissions.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed() && !self.worker.is_finished()
    }

    /// Stop accepting submissions, flush what is queued and wait for the worker to exit.
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.worker.await;
    }
}

async fn run<I, O, F, Fut, E>(
    mut receiver: mpsc::Receiver<Pending<I, O>>,
    config: BatchConfig,
    batch_fn: F,
    stats: Arc<BatchStats>,
) where
    F: Fn(Vec<I>) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<O>, E>>,
    E: std::fmt::Display,
{
    while let Some(first) = receiver.recv().await {
        // Measured from arrival: an item queued behind a slow batch may already be due.
        let deadline = first.queued_at + config.batch_timeout;
        let mut pending = Vec::with_capacity(config.batch_size);
        pending.push(first);

        while pending.len() < config.batch_size {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(item)) => pending.push(item),
                // Closed or timed out: release what we have.
                Ok(None) | Err(_) => break,
            }
        }

        dispatch(&batch_fn, pending, &stats).await;
    }
    debug!("batch processor worker exiting");
}

async fn dispatch<I, O, F, Fut, E>(batch_fn: &F, pending: Vec<Pending<I, O>>, stats: &BatchStats)
where
    F: Fn(Vec<I>) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<O>, E>>,
    E: std::fmt::Display,
{
    let expected = pending.len();
    let (inputs, replies): (Vec<I>, Vec<_>) =
        pending.into_iter().map(|p| (p.input, p.reply)).unzip();
    stats.record_batch(expected as u64);

    match batch_fn(inputs).await {
        Ok(outputs) if outputs.len() == expected => {
            for (reply, output) in replies.into_iter().zip(outputs) {
                let _ = reply.send(Ok(output));
            }
        }
        Ok(outputs) => {
            let got = outputs.len();
            stats.contract_violations.fetch_add(1, Ordering::Relaxed);
            warn!(expected, got, "batch function violated output contract");
            for reply in replies {
                let _ = reply.send(Err(RuntimeError::ContractViolation { expected, got }));
            }
        }
        Err(e) => {
            stats.batch_failures.fetch_add(1, Ordering::Relaxed);
            let message = e.to_string();
            warn!(batch = expected, error = %message, "batch function failed");
            for reply in replies {
                let _ = reply.send(Err(RuntimeError::BatchFailed(message.clone())));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{new_cancel_pair, CancelReason};
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;

    fn doubling(config: BatchConfig) -> BatchProcessor<u32, u32> {
        BatchProcessor::start(config, |items: Vec<u32>| async move {
            Ok::<_, String>(items.into_iter().map(|x| x * 2).collect())
        })
    }

    #[test]
    fn test_batch_config_default() {
        let config = BatchConfig::default();
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.batch_timeout, Duration::from_millis(2));
        assert_eq!(config.queue_capacity, 4096);
    }

    #[tokio::test]
    async fn test_single_submit_released_by_timeout() {
        let processor = doubling(BatchConfig {
            batch_size: 100,
            batch_timeout: Duration::from_millis(5),
            queue_capacity: 16,
        });
        assert_eq!(processor.submit(21).await.unwrap(), 42);
        let stats = processor.stats();
        assert_eq!(stats.batches_dispatched, 1);
        assert_eq!(stats.items_dispatched, 1);
    }

    #[tokio::test]
    async fn test_outputs_routed_to_their_callers() {
        let processor = doubling(BatchConfig {
            batch_size: 8,
            batch_timeout: Duration::from_millis(20),
            queue_capacity: 64,
        });
        let results = join_all((0..32u32).map(|i| processor.submit(i))).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i as u32 * 2);
        }
        let stats = processor.stats();
        assert_eq!(stats.items_dispatched, 32);
        assert!(stats.batches_dispatched >= 4);
    }

    #[tokio::test]
    async fn test_batch_released_at_size() {
        let sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = sizes.clone();
        let processor = BatchProcessor::start(
            BatchConfig {
                batch_size: 4,
                batch_timeout: Duration::from_secs(30),
                queue_capacity: 64,
            },
            move |items: Vec<u32>| {
                seen.lock().push(items.len());
                async move { Ok::<_, String>(items) }
            },
        );
        let results = tokio::time::timeout(
            Duration::from_secs(5),
            join_all((0..8u32).map(|i| processor.submit(i))),
        )
        .await
        .expect("full batches must not wait for the timeout");
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(*sizes.lock(), vec![4, 4]);
    }

    #[tokio::test]
    async fn test_contract_violation_fails_whole_batch() {
        let processor = BatchProcessor::start(
            BatchConfig {
                batch_size: 3,
                batch_timeout: Duration::from_millis(50),
                queue_capacity: 16,
            },
            |items: Vec<u32>| async move {
                let mut out = items;
                out.pop();
                Ok::<_, String>(out)
            },
        );
        let results = join_all((0..3u32).map(|i| processor.submit(i))).await;
        for result in results {
            assert!(matches!(
                result,
                Err(RuntimeError::ContractViolation { expected: 3, got: 2 })
            ));
        }
        assert_eq!(processor.stats().contract_violations, 1);
    }

    #[tokio::test]
    async fn test_batch_function_error_fails_every_caller() {
        let processor: BatchProcessor<u32, u32> = BatchProcessor::start(
            BatchConfig {
                batch_size: 2,
                batch_timeout: Duration::from_millis(50),
                queue_capacity: 16,
            },
            |_items: Vec<u32>| async move { Err::<Vec<u32>, _>("backend down") },
        );
        let results = join_all((0..2u32).map(|i| processor.submit(i))).await;
        for result in results {
            match result {
                Err(RuntimeError::BatchFailed(msg)) => assert_eq!(msg, "backend down"),
                other => panic!("unexpected result: {:?}", other.map(|_| ())),
            }
        }
        assert_eq!(processor.stats().batch_failures, 1);
    }

    #[tokio::test]
    async fn test_bounded_queue_applies_backpressure() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (gate_fn, calls_fn) = (gate.clone(), calls.clone());
        let processor = Arc::new(BatchProcessor::start(
            BatchConfig {
                batch_size: 1,
                batch_timeout: Duration::from_millis(1),
                queue_capacity: 1,
            },
            move |items: Vec<u32>| {
                let gate = gate_fn.clone();
                calls_fn.fetch_add(1, Ordering::SeqCst);
                async move {
                    let _permit = gate.acquire().await.map_err(|e| e.to_string())?;
                    Ok::<_, String>(items)
                }
            },
        ));

        // First item occupies the worker, second fills the queue, third must wait for space.
        let p1 = processor.clone();
        let first = tokio::spawn(async move { p1.submit(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let p2 = processor.clone();
        let second = tokio::spawn(async move { p2.submit(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let p3 = processor.clone();
        let third = tokio::spawn(async move { p3.submit(3).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!third.is_finished());

        gate.add_permits(3);
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
        assert_eq!(third.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_submit_with_cancel() {
        let processor = doubling(BatchConfig::default());
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        let result = processor.submit_with_cancel(1, &token).await;
        assert!(matches!(
            result,
            Err(RuntimeError::Cancelled(CancelReason::UserRequested))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops() {
        let processor = doubling(BatchConfig::default());
        assert_eq!(processor.submit(5).await.unwrap(), 10);
        assert!(processor.is_running());
        processor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_arrival_not_dequeue() {
        let processor = BatchProcessor::start(
            BatchConfig {
                batch_size: 100,
                batch_timeout: Duration::from_millis(30),
                queue_capacity: 16,
            },
            |items: Vec<u32>| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, String>(items)
            },
        );
        let start = Instant::now();
        let late = async {
            // Arrives at 40ms while the first batch runs from 30ms to 80ms.
            tokio::time::sleep(Duration::from_millis(40)).await;
            let out = processor.submit(2).await;
            (out, start.elapsed())
        };
        let (first, (second, second_done)) = tokio::join!(processor.submit(1), late);
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
        // Already due when dequeued at 80ms, so it runs from 80ms to 130ms.
        assert!(second_done >= Duration::from_millis(130));
        assert!(second_done < Duration::from_millis(140));
        assert_eq!(processor.stats().batches_dispatched, 2);
    }
}
