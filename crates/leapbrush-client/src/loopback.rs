//! In-process transport.
//!
//! Connections are pairs of in-memory pipes, so a client [`Session`] can talk
//! to a server living in the same process without sockets or certificates.
//! Tests use it with scripted fake servers and with the real server logic.
//!
//! Either side dropping the connection fails every stream on it: the client
//! by [`Connection::close`], the server by dropping its [`MemoryPeer`] and the
//! stream halves it accepted.
//!
//! [`Session`]: crate::Session

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
};

use crate::{
    Connection, Connector, RecvHalf, SendHalf, ServerEndpoint, TransportConfig, TransportError,
    error::{ConnectionFailure, StreamFailure},
};

/// Capacity of each in-memory pipe, per direction.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Server side of one in-memory stream.
pub type PeerStream = (WriteHalf<DuplexStream>, ReadHalf<DuplexStream>);

/// Create a connected connector/listener pair.
#[must_use]
pub fn memory_transport() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::channel(16);
    (MemoryConnector { peers: tx }, MemoryListener { peers: rx })
}

/// Client side: every `connect` hands a new [`MemoryPeer`] to the listener.
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    peers: mpsc::Sender<MemoryPeer>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        _config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let (streams_tx, streams_rx) = mpsc::channel(16);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let peer = MemoryPeer { streams: streams_rx, closed: Arc::clone(&closed) };
        self.peers.send(peer).await.map_err(|_| {
            TransportError::connection(ConnectionFailure::Refused, "no listener for loopback")
        })?;

        tracing::debug!(%endpoint, "loopback connection established");
        Ok(Box::new(MemoryConnection { streams: Mutex::new(Some(streams_tx)), closed }))
    }
}

/// Server side: yields one [`MemoryPeer`] per client connection.
#[derive(Debug)]
pub struct MemoryListener {
    peers: mpsc::Receiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection. `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

/// Server view of one client connection.
///
/// Dropping it closes the connection for the client.
#[derive(Debug)]
pub struct MemoryPeer {
    streams: mpsc::Receiver<DuplexStream>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemoryPeer {
    /// Wait for the client to open the next stream. `None` once the client
    /// closed the connection.
    pub async fn accept_bi(&mut self) -> Option<PeerStream> {
        let pipe = self.streams.recv().await?;
        let (read, write) = tokio::io::split(pipe);
        Some((write, read))
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

struct MemoryConnection {
    /// `None` after `close`.
    streams: Mutex<Option<mpsc::Sender<DuplexStream>>>,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_bi(&self) -> Result<(SendHalf, RecvHalf), TransportError> {
        let lost = || TransportError::stream(StreamFailure::ConnectionLost, "loopback closed");

        if *self.closed.borrow() {
            return Err(lost());
        }
        let sender = self.streams.lock().ok().and_then(|guard| guard.clone()).ok_or_else(lost)?;

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        sender.send(theirs).await.map_err(|_| lost())?;

        let (read, write) = tokio::io::split(ours);
        Ok((Box::new(write), Box::new(read)))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.streams.lock() {
            guard.take();
        }
        self.closed.send_replace(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::Scheme;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint::new(Scheme::Plaintext, "loopback", 8402)
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (connector, mut listener) = memory_transport();
        let conn = connector.connect(&endpoint(), &TransportConfig::default()).await.expect("connect");
        let mut peer = listener.accept().await.expect("peer");

        let (mut send, mut recv) = conn.open_bi().await.expect("open");
        let (mut peer_send, mut peer_recv) = peer.accept_bi().await.expect("accept");

        send.write_all(b"ping").await.expect("write");
        send.shutdown().await.expect("fin");
        let mut got = Vec::new();
        peer_recv.read_to_end(&mut got).await.expect("read");
        assert_eq!(got, b"ping");

        peer_send.write_all(b"pong").await.expect("write");
        drop(peer_send);
        let mut got = Vec::new();
        recv.read_to_end(&mut got).await.expect("read");
        assert_eq!(got, b"pong");
    }

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let (connector, listener) = memory_transport();
        drop(listener);

        let err = connector
            .connect(&endpoint(), &TransportConfig::default())
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, TransportError::Connection { kind: ConnectionFailure::Refused, .. }));
    }

    #[tokio::test]
    async fn dropped_peer_closes_connection() {
        let (connector, mut listener) = memory_transport();
        let conn = connector.connect(&endpoint(), &TransportConfig::default()).await.expect("connect");
        let peer = listener.accept().await.expect("peer");

        drop(peer);
        conn.closed().await;

        let err = conn.open_bi().await.err().expect("should fail");
        assert!(matches!(err, TransportError::Stream { kind: StreamFailure::ConnectionLost, .. }));
    }

    #[tokio::test]
    async fn client_close_ends_accept_loop() {
        let (connector, mut listener) = memory_transport();
        let conn = connector.connect(&endpoint(), &TransportConfig::default()).await.expect("connect");
        let mut peer = listener.accept().await.expect("peer");

        conn.close();
        assert!(peer.accept_bi().await.is_none());
        conn.closed().await;
    }
}
