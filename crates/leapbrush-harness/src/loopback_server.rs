//! The real server logic over the loopback transport.
//!
//! Streams of one connection live in a task set owned by that connection's
//! task. When the client closes the connection the set is aborted, so the
//! client sees every stream of the connection fail together, as it would
//! with QUIC.

use std::{sync::Arc, time::Duration};

use leapbrush_client::loopback::{MemoryConnector, MemoryListener, MemoryPeer, memory_transport};
use leapbrush_server::{Hub, WorldConfig, serve_stream};
use tokio::task::{JoinHandle, JoinSet};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// In-process server sharing one [`Hub`] across all loopback connections.
#[derive(Debug)]
pub struct LoopbackServer {
    hub: Arc<Hub>,
    connector: MemoryConnector,
    accept: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl LoopbackServer {
    /// Start serving. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(config: WorldConfig) -> Self {
        let hub = Arc::new(Hub::new(config));
        let (connector, listener) = memory_transport();
        let maintenance = hub.spawn_maintenance();
        let accept = tokio::spawn(accept_loop(Arc::clone(&hub), listener));

        Self { hub, connector, accept, maintenance }
    }

    /// Connector that reaches this server.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }

    /// Shared server state.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// End every stream with `Unavailable` and stop accepting.
    pub async fn shutdown(self) {
        self.hub.shutdown();
        if let Err(e) = self.maintenance.await {
            tracing::warn!("maintenance task failed: {}", e);
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, self.accept).await.is_err() {
            tracing::warn!("loopback streams did not finish within {:?}", DRAIN_TIMEOUT);
        }
    }
}

async fn accept_loop(hub: Arc<Hub>, mut listener: MemoryListener) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = hub.shutdown_requested() => break,
            peer = listener.accept() => match peer {
                Some(peer) => {
                    connections.spawn(serve_peer(Arc::clone(&hub), peer));
                },
                None => break,
            },
        }
    }

    while connections.join_next().await.is_some() {}
}

async fn serve_peer(hub: Arc<Hub>, mut peer: MemoryPeer) {
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            () = hub.shutdown_requested() => {
                // Streams finish themselves with a trailer.
                while streams.join_next().await.is_some() {}
                return;
            },
            stream = peer.accept_bi() => match stream {
                Some((send, recv)) => {
                    streams.spawn(serve_stream(Arc::clone(&hub), send, recv));
                },
                None => break,
            },
            Some(joined) = streams.join_next(), if !streams.is_empty() => {
                if let Ok(Err(e)) = joined {
                    tracing::debug!("loopback stream ended: {}", e);
                }
            },
        }
    }

    tracing::debug!(streams = streams.len(), "loopback client closed connection");
    streams.shutdown().await;
}
