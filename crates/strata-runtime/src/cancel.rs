//! Cooperative cancellation for ingestion and export work.
//!
//! A [`CancelHandle`] triggers cancellation; any number of cloned [`CancelToken`]s observe it.
//! Long-running work checks the token at its boundaries (induction tiers, store round trips,
//! batch submissions) and can also `await` [`CancelToken::cancelled`] inside a `select!`.
//! Cancelling never rolls back work that has already been issued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit caller cancellation
    #[default]
    UserRequested,
    /// The owning component is shutting down
    Shutdown,
    /// A deadline expired before the work finished
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Shutdown => write!(f, "Shutdown"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Operation cancelled: {0}")]
pub struct CancelledError(pub CancelReason);

struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn new(reason: Option<CancelReason>) -> Arc<Self> {
        Arc::new(CancelState {
            cancelled: AtomicBool::new(reason.is_some()),
            reason: Mutex::new(reason),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self.reason.lock();
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A lightweight, cloneable cancellation token.
/// Multiple recipients can listen for cancellation.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl Default for CancelToken {
    /// A detached token that is never cancelled.
    fn default() -> Self {
        CancelToken {
            state: CancelState::new(None),
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.state.reason.lock()
    }

    /// Return `Err` if cancellation has been requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError(self.cancelled_reason().unwrap_or_default()))
        } else {
            Ok(())
        }
    }

    /// Wait until cancellation is requested. Returns the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return self.cancelled_reason().unwrap_or_default();
            }
            notified.await;
        }
    }

    /// Create a child token that is cancelled when the parent is cancelled,
    /// but can also be cancelled independently.
    ///
    /// The parent holds children weakly; children that were dropped or already cancelled are
    /// pruned whenever a new child is registered.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let state = CancelState::new(self.cancelled_reason());
        {
            let mut children = self.state.children.lock();
            children.retain(|c| c.upgrade().is_some_and(|c| !c.is_cancelled()));
            children.push(Arc::downgrade(&state));
        }
        // The parent may have been cancelled between reading its reason and registering.
        if let Some(reason) = self.cancelled_reason() {
            state.cancel(reason);
        }
        (
            CancelToken {
                state: state.clone(),
            },
            CancelHandle { state },
        )
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = CancelState::new(None);
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}
