//! Transport seams.
//!
//! A [`Connector`] dials a [`ServerEndpoint`] and yields a [`Connection`] that
//! can open bidirectional byte streams. Sessions and channels are written
//! against these traits only, so QUIC and the in-process loopback are
//! interchangeable.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{ServerEndpoint, TransportConfig, TransportError};

/// Client-to-server half of a stream. Shutting it down sends FIN.
pub type SendHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Server-to-client half of a stream. EOF means the server sent FIN.
pub type RecvHalf = Box<dyn AsyncRead + Send + Unpin>;

/// One established connection.
///
/// Implementations must fail every open stream once the connection itself is
/// lost, so that no channel operation hangs on a dead connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new bidirectional stream.
    ///
    /// # Errors
    ///
    /// `TransportError::Stream` if the connection is gone.
    async fn open_bi(&self) -> Result<(SendHalf, RecvHalf), TransportError>;

    /// Start closing the connection. Open streams fail shortly after.
    fn close(&self);

    /// Resolve once the connection is fully closed, by either side.
    async fn closed(&self);
}

/// Factory for connections to one kind of transport.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a connection.
    ///
    /// # Errors
    ///
    /// `TransportError::Connection` classified by cause. Implementations are
    /// not required to enforce `config.connect_timeout`; the session does.
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError>;
}
