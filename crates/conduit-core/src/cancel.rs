//! Cancellation token for background tasks owned by disposable components.
//!
//! Pingers, stream channels and channel pairs run background tasks. Disposing
//! the owning component cancels its token, and the task observes the
//! cancellation either by polling [`CancellationToken::is_cancelled`] or by
//! awaiting [`CancellationToken::cancelled`] inside a `select!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token for cooperative cancellation of async tasks.
///
/// This token can be cloned and shared across tasks. When `cancel()` is called
/// on any clone, all clones observe the cancellation.
///
/// # Example
///
/// ```
/// use conduit_core::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every task awaiting [`Self::cancelled`].
    ///
    /// Returns `true` only for the call that actually flipped the token.
    pub fn cancel(&self) -> bool {
        let first = !self.state.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.state.notify.notify_waiters();
        }
        first
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel() is not lost.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
