//! Cooperative cancellation signal shared between the queue and a download worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// One-way cancellation signal created when an item is admitted to the queue.
///
/// Clones observe the same signal. Once cancelled a token never becomes live
/// again; re-admitting an item always creates a fresh token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a live token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation.
    ///
    /// Returns `true` only for the call that moved the token from live to
    /// cancelled.
    pub fn cancel(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.cancel();
        true
    }

    /// Returns true once the token has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves when the token is signalled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Waits up to `timeout` for cancellation.
    ///
    /// Returns `true` if the token was signalled before the timeout elapsed.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.cancelled())
            .await
            .is_ok()
    }
}
