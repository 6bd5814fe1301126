//! QUIC transport for the client.
//!
//! Thin adapter from quinn to the [`Connector`]/[`Connection`] seams. Each
//! RPC becomes one bidirectional QUIC stream; protocol logic stays in the
//! session and channel types.
//!
//! # Security
//!
//! `ssl://` endpoints verify the server certificate against the bundled web
//! PKI roots plus any PEM roots named in
//! [`TransportConfig::ca_cert_path`]. Plain endpoints still run TLS 1.3 (QUIC
//! requires it) but accept any certificate, which matches how development
//! servers with self-signed certificates are reached.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use leapbrush_proto::ALPN_PROTOCOL;
use quinn::{ClientConfig, Endpoint};
use rustls::RootCertStore;

use crate::{
    Connection, Connector, RecvHalf, SendHalf, ServerEndpoint, TransportConfig, TransportError,
    error::{ConnectionFailure, StreamFailure},
};

/// Connector that dials servers over QUIC.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuicConnector;

impl QuicConnector {
    /// Create a connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for QuicConnector {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        config: &TransportConfig,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let addr = resolve(endpoint).await?;
        let client_config = client_config(endpoint, config)?;

        let bind: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut quic = Endpoint::client(bind).map_err(|e| {
            TransportError::connection(
                ConnectionFailure::Unreachable,
                format!("endpoint creation failed: {e}"),
            )
        })?;
        quic.set_default_client_config(client_config);

        tracing::debug!(%endpoint, %addr, "dialing");

        let connection = quic
            .connect(addr, endpoint.host())
            .map_err(|e| {
                TransportError::connection(ConnectionFailure::Unreachable, format!("connect: {e}"))
            })?
            .await
            .map_err(classify_connection_error)?;

        Ok(Box::new(QuicConnection { connection, endpoint: quic }))
    }
}

/// Established QUIC connection.
struct QuicConnection {
    connection: quinn::Connection,
    /// Kept alive for the lifetime of the connection.
    endpoint: Endpoint,
}

#[async_trait]
impl Connection for QuicConnection {
    async fn open_bi(&self) -> Result<(SendHalf, RecvHalf), TransportError> {
        let (send, recv) = self.connection.open_bi().await.map_err(|e| {
            TransportError::stream(StreamFailure::ConnectionLost, format!("open_bi failed: {e}"))
        })?;
        Ok((Box::new(send), Box::new(recv)))
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"client closing");
    }

    async fn closed(&self) {
        let reason = self.connection.closed().await;
        tracing::trace!(%reason, "connection closed");
        self.endpoint.wait_idle().await;
    }
}

async fn resolve(endpoint: &ServerEndpoint) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
        .await
        .map_err(|e| TransportError::connection(ConnectionFailure::Dns, e))?;

    addrs.next().ok_or_else(|| {
        TransportError::connection(
            ConnectionFailure::Dns,
            format!("{} resolved to no addresses", endpoint.host()),
        )
    })
}

fn classify_connection_error(err: quinn::ConnectionError) -> TransportError {
    use quinn::ConnectionError as E;

    let kind = match &err {
        E::TimedOut => ConnectionFailure::Timeout,
        E::TransportError(_) => ConnectionFailure::Tls,
        E::ConnectionClosed(_) | E::ApplicationClosed(_) | E::Reset | E::LocallyClosed => {
            ConnectionFailure::Refused
        },
        _ => ConnectionFailure::Unreachable,
    };
    TransportError::connection(kind, err)
}

fn client_config(
    endpoint: &ServerEndpoint,
    config: &TransportConfig,
) -> Result<ClientConfig, TransportError> {
    let tls_error = |reason: String| TransportError::connection(ConnectionFailure::Tls, reason);

    let mut crypto = if endpoint.is_secure() {
        rustls::ClientConfig::builder()
            .with_root_certificates(trusted_roots(config)?)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
            .with_no_client_auth()
    };

    // Must match server's ALPN protocol
    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| tls_error(format!("QUIC crypto config: {e}")))?;
    let mut client = ClientConfig::new(Arc::new(quic_crypto));

    let mut transport = quinn::TransportConfig::default();
    let idle = quinn::IdleTimeout::try_from(config.idle_timeout)
        .map_err(|e| tls_error(format!("idle timeout out of range: {e}")))?;
    transport.max_idle_timeout(Some(idle));
    transport.keep_alive_interval(Some(config.keep_alive_interval));
    client.transport_config(Arc::new(transport));

    Ok(client)
}

fn trusted_roots(config: &TransportConfig) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.ca_cert_path {
        let pem = std::fs::read(path).map_err(|e| {
            TransportError::connection(
                ConnectionFailure::Tls,
                format!("failed to read CA file '{}': {e}", path.display()),
            )
        })?;

        for cert in rustls_pemfile::certs(&mut &pem[..]) {
            let cert = cert.map_err(|e| {
                TransportError::connection(ConnectionFailure::Tls, format!("bad CA PEM: {e}"))
            })?;
            roots.add(cert).map_err(|e| {
                TransportError::connection(ConnectionFailure::Tls, format!("bad CA cert: {e}"))
            })?;
        }
    }

    Ok(roots)
}

/// Certificate verifier that accepts any certificate.
///
/// Used only for endpoints without the `ssl://` prefix.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::Scheme;

    #[test]
    fn plaintext_config_builds() {
        let endpoint = ServerEndpoint::new(Scheme::Plaintext, "localhost", 8402);
        assert!(client_config(&endpoint, &TransportConfig::development()).is_ok());
    }

    #[test]
    fn secure_config_accepts_extra_ca() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate cert");
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(cert.cert.pem().as_bytes()).expect("write pem");

        let config =
            TransportConfig { ca_cert_path: Some(file.path().to_path_buf()), ..Default::default() };
        let roots = trusted_roots(&config).expect("roots");

        assert_eq!(roots.len(), webpki_roots::TLS_SERVER_ROOTS.len() + 1);
    }

    #[test]
    fn missing_ca_file_is_a_tls_failure() {
        let config = TransportConfig {
            ca_cert_path: Some("/nonexistent/leapbrush-ca.pem".into()),
            ..Default::default()
        };
        let endpoint = ServerEndpoint::new(Scheme::Secure, "example.com", 443);

        let err = client_config(&endpoint, &config).expect_err("should fail");
        assert!(matches!(err, TransportError::Connection { kind: ConnectionFailure::Tls, .. }));
    }

    #[tokio::test]
    async fn unresolvable_host_is_a_dns_failure() {
        let endpoint = ServerEndpoint::new(Scheme::Plaintext, "nonexistent.invalid", 8402);

        let err = resolve(&endpoint).await.expect_err("should fail");
        assert!(matches!(err, TransportError::Connection { kind: ConnectionFailure::Dns, .. }));
    }
}
