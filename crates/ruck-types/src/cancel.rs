use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Result, RuckError};

/// Cooperative cancellation token shared between long-running operations.
///
/// Cancellation propagates from parent to child: a child created with
/// [`CancelToken::with_timeout`] observes the parent's flag and additionally
/// carries its own deadline. Children never cancel their parent.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    /// A fresh root token with no deadline.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// Derive a child token that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Request cancellation of this token and its children.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Return `Err(Cancelled)` if the token is cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Err(RuckError::Cancelled("cancelled by caller".into()));
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Err(RuckError::Cancelled("deadline exceeded".into()));
            }
        }
        if let Some(parent) = &self.inner.parent {
            parent.check()?;
        }
        Ok(())
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
