//! Cancellation token for cooperative cancellation
//!
//! Cancelling never interrupts running code. The event loop checks the
//! token at the next scheduling point and settles the owner from there.
//! Tokens can be linked to form parent-child relationships.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use crate::error::{WeftError, WeftResult};

/// Token for checking and triggering cancellation
///
/// Clones share state. A child token reports cancelled when any of its
/// ancestors is cancelled.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    /// Create a new independent cancellation token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Create a child token linked to this one
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Check if cancellation was requested, here or on any parent
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.inner.parent {
            Some(ref parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Request cancellation
    ///
    /// Only sets this token's flag; parents are untouched.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Return `Err(Cancelled)` if cancellation was requested
    ///
    /// ```ignore
    /// async fn body(token: CancellationToken) -> WeftResult<()> {
    ///     loop {
    ///         token.check()?;
    ///         yield_now().await;
    ///     }
    /// }
    /// ```
    #[inline]
    pub fn check(&self) -> WeftResult<()> {
        if self.is_cancelled() {
            Err(WeftError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Reset this token's own flag (parents are untouched)
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_cancellation() {
        let token = CancellationToken::new();

        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();

        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(WeftError::Cancelled)));
    }

    #[test]
    fn test_child_token() {
        let parent = CancellationToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_independent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_reset() {
        let token = CancellationToken::new();
        token.cancel();
        token.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_clone_shares_state() {
        let token1 = CancellationToken::new();
        let token2 = token1.clone();

        token1.cancel();
        assert!(token2.is_cancelled());
    }
}
