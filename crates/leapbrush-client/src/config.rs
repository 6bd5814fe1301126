//! Transport and retry configuration.

use std::{path::PathBuf, time::Duration};

/// Timeouts and TLS settings for one session.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on name resolution plus handshake
    pub connect_timeout: Duration,
    /// Bound on one unary call, from stream open to trailer
    pub rpc_timeout: Duration,
    /// Bound on waiting for the connection to close in `close_and_wait`
    pub shutdown_timeout: Duration,
    /// Connection is considered dead after this long without packets
    pub idle_timeout: Duration,
    /// Interval of transport keepalives, keeping idle listen streams open
    pub keep_alive_interval: Duration,
    /// Extra PEM root certificates trusted for `ssl://` endpoints
    pub ca_cert_path: Option<PathBuf>,
}

impl TransportConfig {
    /// Short timeouts for local development and tests.
    #[must_use]
    pub fn development() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(2),
            ca_cert_path: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            ca_cert_path: None,
        }
    }
}

/// Reconnect policy applied by [`Lifecycle`](crate::Lifecycle).
///
/// Delay before attempt `n` (zero based) is
/// `min(initial_backoff * multiplier^n, max_backoff)`, shortened by a random
/// fraction of at most `jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Whether failures lead to `Reconnecting` instead of `Disconnected`
    pub enabled: bool,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any delay
    pub max_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Largest fraction of a delay removed at random, in `[0, 1]`
    pub jitter: f64,
    /// Give up once this many retries in a row have failed. `None` retries
    /// until cancelled.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}
