//! Connector with injected dial failures.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use async_trait::async_trait;
use leapbrush_client::{
    Connection, ConnectionFailure, Connector, ServerEndpoint, TransportConfig, TransportError,
};

#[derive(Debug)]
struct Counters {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

/// Fails the next `n` dials with a chosen failure, then delegates.
///
/// Clones share their counters, so a test can keep one clone while a
/// lifecycle owns another.
#[derive(Debug, Clone)]
pub struct FlakyConnector<C> {
    inner: C,
    kind: ConnectionFailure,
    counters: Arc<Counters>,
}

impl<C> FlakyConnector<C> {
    /// Wrap `inner`, failing the first `failures` dials with `kind`.
    pub fn new(inner: C, failures: u32, kind: ConnectionFailure) -> Self {
        Self {
            inner,
            kind,
            counters: Arc::new(Counters {
                remaining_failures: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    /// Fail the next `failures` dials.
    pub fn fail_next(&self, failures: u32) {
        self.counters.remaining_failures.store(failures, Ordering::SeqCst);
    }

    /// Dials attempted so far, failed or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.counters.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C: Connector> Connector for FlakyConnector<C> {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let attempt = self.counters.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let inject = self
            .counters
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if inject {
            tracing::debug!(%endpoint, attempt, kind = ?self.kind, "injecting dial failure");
            return Err(TransportError::Connection {
                kind: self.kind,
                reason: format!("injected failure on attempt {attempt}"),
            });
        }

        self.inner.connect(endpoint, config).await
    }
}
