//! QUIC listener for headsets.
//!
//! Every client connection negotiates ALPN `leapbrush`; each RPC then arrives
//! as one client-opened bidirectional stream. The certificate comes from a
//! PEM pair when both paths are given. Otherwise a throwaway certificate for
//! `localhost` is minted at startup, good only for clients using the
//! unverified (no `ssl://`) scheme.

use std::{net::SocketAddr, sync::Arc};

use leapbrush_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::ServerError;

/// Certificate chain and its private key.
type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Listening QUIC endpoint.
#[derive(Debug)]
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Listen on `address` with the PEM identity at `cert_path`/`key_path`,
    /// or a self-signed one when either path is missing.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` for a bad address or unreadable identity
    /// - `ServerError::Transport` if the UDP socket cannot be bound
    pub fn bind(
        address: &str,
        cert_path: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("bad bind address {address:?}: {e}")))?;

        let identity = match (cert_path, key_path) {
            (Some(cert), Some(key)) => identity_from_pem(cert, key)?,
            _ => self_signed_identity()?,
        };
        let endpoint = Endpoint::server(server_config(identity)?, addr)
            .map_err(|e| ServerError::Transport(format!("cannot listen on {addr}: {e}")))?;

        tracing::info!(%addr, alpn = "leapbrush", "listening for headsets");
        Ok(Self { endpoint })
    }

    /// Next connection whose handshake completed.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` once the endpoint is closed, or for a client
    /// whose handshake failed (for example a wrong ALPN).
    pub async fn accept(&self) -> Result<QuinnConnection, ServerError> {
        let Some(incoming) = self.endpoint.accept().await else {
            return Err(ServerError::Transport("listener closed".into()));
        };
        let connection = incoming
            .await
            .map_err(|e| ServerError::Transport(format!("handshake failed: {e}")))?;
        Ok(QuinnConnection { connection })
    }

    /// Bound socket address, with the real port when bound to port 0.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` if the socket cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint.local_addr().map_err(|e| ServerError::Transport(e.to_string()))
    }

    /// Stop listening, close remaining connections and wait for the close
    /// frames to go out.
    pub async fn close(&self) {
        self.endpoint.close(0u32.into(), b"server shutdown");
        self.endpoint.wait_idle().await;
    }
}

/// One headset connection.
#[derive(Debug, Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Next RPC stream opened by the headset.
    ///
    /// # Errors
    ///
    /// `ServerError::Transport` once the connection is gone.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("no further streams: {e}")))
    }

    /// Headset address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Resolves once either side closed the connection.
    pub async fn closed(&self) {
        let reason = self.connection.closed().await;
        tracing::debug!(peer = %self.remote_addr(), %reason, "connection closed");
    }

    /// Close now with an application error code.
    pub fn close(&self, code: quinn::VarInt, reason: &[u8]) {
        self.connection.close(code, reason);
    }
}

fn identity_from_pem(cert_path: &str, key_path: &str) -> Result<Identity, ServerError> {
    let read = |path: &str| {
        std::fs::read(path).map_err(|e| ServerError::Config(format!("cannot read {path:?}: {e}")))
    };
    let (cert_pem, key_pem) = (read(cert_path)?, read(key_path)?);

    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("{cert_path:?} is not a PEM chain: {e}")))?;
    if chain.is_empty() {
        return Err(ServerError::Config(format!("{cert_path:?} holds no certificate")));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| ServerError::Config(format!("{key_path:?} is not a PEM key: {e}")))?
        .ok_or_else(|| ServerError::Config(format!("{key_path:?} holds no private key")))?;

    Ok((chain, key))
}

fn self_signed_identity() -> Result<Identity, ServerError> {
    let minted = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("cannot mint certificate: {e}")))?;
    tracing::warn!("no certificate given, headsets must connect without ssl://");

    let key = PrivatePkcs8KeyDer::from(minted.key_pair.serialize_der());
    Ok((vec![minted.cert.der().clone()], key.into()))
}

fn server_config((chain, key): Identity) -> Result<ServerConfig, ServerError> {
    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ServerError::Config(format!("certificate and key do not match: {e}")))?;
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| ServerError::Config(format!("TLS setup unusable for QUIC: {e}")))?;
    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}
