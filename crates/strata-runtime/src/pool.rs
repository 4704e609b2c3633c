//! Bounded object pool for reusable scratch buffers.
//!
//! Checkout never blocks: when no idle object is available a fresh one is built by the
//! factory. On drop, a [`Pooled`] guard resets its object and hands it back, unless the pool
//! already holds `max_idle` objects, in which case the object is simply dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Configuration for the object pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle objects retained for reuse.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_idle: 16 }
    }
}

/// Statistics about the object pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Objects built by the factory.
    pub created: u64,
    /// Checkouts served from the idle list.
    pub reused: u64,
    /// Objects dropped on return because the idle list was full.
    pub discarded: u64,
    /// Objects currently idle.
    pub idle: usize,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct PoolInner<T> {
    config: PoolConfig,
    idle: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

/// A pool of reusable objects. Cloning shares the same pool.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Creates a new pool that builds objects with `factory`.
    pub fn new(config: PoolConfig, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                config,
                factory: Box::new(factory),
                reset: None,
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pool that also runs `reset` on every object returned to it.
    pub fn with_reset(
        config: PoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                config,
                factory: Box::new(factory),
                reset: Some(Box::new(reset)),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Checks out an idle object, or builds a new one.
    pub fn get(&self) -> Pooled<T> {
        let recycled = self.inner.idle.lock().pop();
        let value = match recycled {
            Some(value) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)()
            }
        };
        Pooled {
            value: Some(value),
            pool: self.inner.clone(),
        }
    }

    /// Gets pool-wide statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
        }
    }
}

/// RAII guard for a checked-out object; returns it to the pool on drop.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the value.
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut value) = self.value.take() else {
            return;
        };
        if let Some(reset) = &self.pool.reset {
            reset(&mut value);
        }
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.config.max_idle {
            idle.push(value);
        } else {
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}
