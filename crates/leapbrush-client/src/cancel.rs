//! Cooperative cancellation.

use std::{fmt, future::Future, sync::Arc, task::Poll};

use tokio::sync::watch;

/// Cancellation signal passed explicitly to every blocking operation.
///
/// Clones share the same signal. A [`child`](Self::child) token is cancelled
/// when any ancestor is, but cancelling the child leaves its ancestors
/// untouched.
#[derive(Clone)]
pub struct CancelToken {
    /// Own flag last, ancestors before it.
    chain: Vec<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// Create an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { chain: vec![Arc::new(flag)] }
    }

    /// Create a token that is also cancelled when `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        let (flag, _) = watch::channel(false);
        let mut chain = self.chain.clone();
        chain.push(Arc::new(flag));
        Self { chain }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.send_replace(true);
        }
    }

    /// Whether this token or any ancestor has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| *flag.borrow())
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers: Vec<_> = self.chain.iter().map(|flag| flag.subscribe()).collect();
        let mut waits: Vec<_> =
            receivers.iter_mut().map(|rx| Box::pin(rx.wait_for(|cancelled| *cancelled))).collect();

        // Senders live in `self.chain`, so a wait only completes on cancellation.
        std::future::poll_fn(|cx| {
            for wait in &mut waits {
                if wait.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        })
        .await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
    }
}
