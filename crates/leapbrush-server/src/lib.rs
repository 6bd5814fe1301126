//! LeapBrush session server.
//!
//! Accepts QUIC connections from headsets and companion apps, keeps the
//! shared world (who is where, which strokes and models are placed on which
//! anchors) and streams changes to every listener that shares an anchor.
//!
//! # Architecture
//!
//! [`World`] is the pure merge and fan-out logic: it takes time as an
//! argument, performs no I/O, and reports which listeners have pending work.
//! [`Hub`] wraps it for async use and owns the wake-up signals. [`Server`]
//! binds the QUIC endpoint and hands every accepted stream to
//! [`serve_stream`].
//!
//! # Components
//!
//! - [`World`]: users, anchors, strokes, models, per-listener progress
//! - [`Hub`]: shared state, listener signals, expiry task
//! - [`serve_stream`]: stream dispatcher shared by every transport
//! - [`QuinnTransport`]: QUIC endpoint via Quinn

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod hub;
mod service;
mod transport;
mod world;

use std::{net::SocketAddr, sync::Arc, time::Duration};

pub use error::ServerError;
pub use hub::{Hub, ListenerSignal, Registration};
pub use service::serve_stream;
use tokio::task::JoinSet;
pub use transport::{QuinnConnection, QuinnTransport};
pub use world::{ListenerId, MIN_APP_VERSION, SERVER_VERSION, World, WorldConfig, WorldError};

/// Grace period for each shutdown step: streams finishing, then the client
/// closing its connection. Whatever is still running afterwards is aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:8402")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// World timing and verbosity
    pub world: WorldConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", leapbrush_proto::DEFAULT_PORT),
            cert_path: None,
            key_path: None,
            world: WorldConfig::default(),
        }
    }
}

/// Production server.
#[derive(Debug)]
pub struct Server {
    transport: QuinnTransport,
    hub: Arc<Hub>,
}

impl Server {
    /// Bind the QUIC endpoint. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// As [`QuinnTransport::bind`].
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;
        let hub = Arc::new(Hub::new(config.world));

        Ok(Self { transport, hub })
    }

    /// Local address the server is bound to.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Shared state.
    #[must_use]
    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Make [`run`](Self::run) end every stream and return.
    ///
    /// Listeners are finished with `Unavailable`.
    pub fn shutdown(&self) {
        self.hub.shutdown();
    }

    /// Accept connections until shutdown, then drain them.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; accept failures of single connections
    /// are logged and skipped.
    pub async fn run(&self) -> Result<(), ServerError> {
        tracing::info!(
            version = SERVER_VERSION,
            min_app_version = MIN_APP_VERSION,
            "server started"
        );

        let maintenance = self.hub.spawn_maintenance();
        let mut shutdown = self.hub.shutdown_signal();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = hub::shutting_down(&mut shutdown) => break,
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        tracing::info!(peer = %conn.remote_addr(), "connection accepted");
                        connections.spawn(handle_connection(conn, Arc::clone(&self.hub)));
                    },
                    Err(e) => tracing::warn!("failed to accept connection: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {},
            }
        }

        if tokio::time::timeout(DRAIN_TIMEOUT * 3, drain(&mut connections)).await.is_err() {
            tracing::warn!(remaining = connections.len(), "aborting connections that did not drain");
            connections.shutdown().await;
        }
        self.transport.close().await;
        if let Err(e) = maintenance.await {
            tracing::warn!("maintenance task failed: {}", e);
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

/// Serve every stream the client opens on `conn`.
async fn handle_connection(conn: QuinnConnection, hub: Arc<Hub>) {
    let peer = conn.remote_addr();
    let mut shutdown = hub.shutdown_signal();
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            () = hub::shutting_down(&mut shutdown) => break,
            accepted = conn.accept_bi() => match accepted {
                Ok((send, recv)) => {
                    streams.spawn(serve_stream(Arc::clone(&hub), send, recv));
                },
                Err(e) => {
                    tracing::debug!(%peer, "connection ended: {}", e);
                    break;
                },
            },
            Some(joined) = streams.join_next(), if !streams.is_empty() => log_stream_result(peer, joined),
        }
    }

    let drained = async {
        while let Some(joined) = streams.join_next().await {
            log_stream_result(peer, joined);
        }
    };
    if hub.is_shutting_down() {
        if tokio::time::timeout(DRAIN_TIMEOUT, drained).await.is_err() {
            tracing::warn!(%peer, remaining = streams.len(), "aborting streams that did not drain");
            streams.shutdown().await;
        }
    } else {
        drained.await;
    }

    if hub.is_shutting_down() && tokio::time::timeout(DRAIN_TIMEOUT, conn.closed()).await.is_err() {
        conn.close(0u32.into(), b"server shutdown");
    }
    tracing::info!(%peer, "connection finished");
}

async fn drain(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

fn log_stream_result(peer: SocketAddr, joined: Result<Result<(), ServerError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {},
        Ok(Err(ServerError::Transport(e))) => tracing::debug!(%peer, "stream dropped: {}", e),
        Ok(Err(e)) => tracing::warn!(%peer, "stream failed: {}", e),
        Err(e) => tracing::error!(%peer, "stream task panicked: {}", e),
    }
}
