//! Async concurrency limiter.
//!
//! A counting semaphore that bounds how many tasks may use a shared resource at once (store
//! connections, running ingestion jobs). Acquisition is a suspension point and observes
//! cancellation; the returned [`LimiterPermit`] releases its slot when dropped.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cancel::CancelToken;
use crate::error::{Result, RuntimeError};

/// Snapshot of limiter usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimiterStats {
    /// Configured maximum concurrency.
    pub capacity: usize,
    /// Permits currently held.
    pub in_flight: usize,
    /// Highest number of permits held at the same time.
    pub peak_in_flight: usize,
    /// Total permits granted.
    pub acquired: u64,
}

struct LimiterCounters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acquired: AtomicU64,
}

/// Bounded-concurrency limiter. Cloning shares the same permits.
#[derive(Clone)]
pub struct AsyncLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<LimiterCounters>,
}

impl std::fmt::Debug for AsyncLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLimiter")
            .field("capacity", &self.capacity)
            .field("available", &self.semaphore.available_permits())
            .finish()
    }
}

impl AsyncLimiter {
    /// Creates a limiter allowing `capacity` concurrent holders (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(LimiterCounters {
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a permit, or return [`RuntimeError::Cancelled`] if `token` fires first.
    pub async fn acquire(&self, token: &CancelToken) -> Result<LimiterPermit> {
        token.check()?;
        let permit = tokio::select! {
            biased;
            reason = token.cancelled() => return Err(RuntimeError::Cancelled(reason)),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| RuntimeError::Closed("limiter"))?
            }
        };
        Ok(self.grant(permit))
    }

    /// Run `fut` while holding a permit.
    pub async fn run<F, T>(&self, token: &CancelToken, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire(token).await?;
        Ok(fut.await)
    }

    /// Number of permits not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured maximum concurrency.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get a snapshot of limiter usage.
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            capacity: self.capacity,
            in_flight: self.counters.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::Acquire),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
        }
    }

    fn grant(&self, permit: OwnedSemaphorePermit) -> LimiterPermit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        LimiterPermit {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }
}

/// RAII guard for one limiter slot.
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<LimiterCounters>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{new_cancel_pair, CancelReason};
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_clamped() {
        assert_eq!(AsyncLimiter::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = AsyncLimiter::new(2);
        let token = CancelToken::default();
        let p1 = limiter.acquire(&token).await.unwrap();
        let _p2 = limiter.acquire(&token).await.unwrap();
        assert_eq!(limiter.available(), 0);
        drop(p1);
        assert_eq!(limiter.available(), 1);
        assert_eq!(limiter.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_capacity() {
        let limiter = AsyncLimiter::new(3);
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move {
                let token = CancelToken::default();
                limiter
                    .run(&token, tokio::time::sleep(Duration::from_millis(5)))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let stats = limiter.stats();
        assert_eq!(stats.acquired, 20);
        assert!(stats.peak_in_flight <= 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_acquire_cancelled_while_waiting() {
        let limiter = AsyncLimiter::new(1);
        let held = limiter.acquire(&CancelToken::default()).await.unwrap();
        let (token, handle) = new_cancel_pair();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&token).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel(CancelReason::Shutdown);
        let result = waiter.await.unwrap();
        assert!(matches!(
            result,
            Err(RuntimeError::Cancelled(CancelReason::Shutdown))
        ));
        drop(held);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_rejects_already_cancelled_token() {
        let limiter = AsyncLimiter::new(4);
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::UserRequested);
        assert!(limiter.acquire(&token).await.is_err());
        assert_eq!(limiter.stats().acquired, 0);
    }
}
