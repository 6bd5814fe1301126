//! Transport error taxonomy.
//!
//! Every failure reaches the caller as a typed [`TransportError`] carrying both
//! a coarse [`ErrorKind`] (what the UI should do) and the underlying cause
//! (what to log). Nothing below this layer retries or swallows an error.

use std::{fmt, io};

use leapbrush_proto::{CodecError, ProtocolError, payloads::call::StatusCode};
use thiserror::Error;

/// Why a connection could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailure {
    /// Host name did not resolve
    Dns,
    /// TLS handshake or certificate verification failed
    Tls,
    /// No route to the server
    Unreachable,
    /// Handshake did not finish within the connect timeout
    Timeout,
    /// Server refused or closed the connection during setup
    Refused,
}

/// Why an open stream stopped working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFailure {
    /// Peer reset this stream
    Reset,
    /// Server ended the call with an error status
    Aborted,
    /// The connection carrying the stream is gone
    ConnectionLost,
    /// Peer sent bytes that do not follow the protocol
    Protocol,
}

/// Which channel an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Outbound update channel
    Update,
    /// Inbound state channel
    State,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update => f.write_str("update"),
            Self::State => f.write_str("state"),
        }
    }
}

/// Coarse classification for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Could not connect
    Connection,
    /// An open stream failed
    Stream,
    /// The server ended a stream cleanly
    StreamEnded,
    /// The caller cancelled
    Cancelled,
    /// The caller misused the API
    Misuse,
    /// A unary call failed
    Rpc,
}

/// Errors surfaced by sessions, channels, and the lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint string could not be parsed
    #[error("invalid endpoint {input:?}: {reason}")]
    InvalidEndpoint {
        /// Input as given
        input: String,
        /// What is wrong with it
        reason: String,
    },

    /// Connection could not be established
    #[error("connection failed ({kind:?}): {reason}")]
    Connection {
        /// Failure class
        kind: ConnectionFailure,
        /// Underlying cause
        reason: String,
    },

    /// An open stream failed
    #[error("stream failed ({kind:?}): {reason}")]
    Stream {
        /// Failure class
        kind: StreamFailure,
        /// Underlying cause
        reason: String,
    },

    /// The server finished the stream cleanly
    #[error("stream ended by server")]
    StreamEnded,

    /// The operation observed cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// A channel of this kind is already open on the session
    #[error("{0} stream is already open on this session")]
    AlreadyOpen(StreamKind),

    /// A unary call completed with an error status
    #[error("rpc failed ({code}): {message}")]
    Rpc {
        /// Status code from the server, or `DeadlineExceeded` locally
        code: StatusCode,
        /// Detail
        message: String,
    },

    /// The session was closed before or during this operation
    #[error("session closed")]
    SessionClosed,
}

impl TransportError {
    /// Coarse classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Stream { .. } => ErrorKind::Stream,
            Self::StreamEnded => ErrorKind::StreamEnded,
            Self::Cancelled | Self::SessionClosed => ErrorKind::Cancelled,
            Self::InvalidEndpoint { .. } | Self::AlreadyOpen(_) => ErrorKind::Misuse,
            Self::Rpc { .. } => ErrorKind::Rpc,
        }
    }

    /// Whether the lifecycle should reconnect after this error.
    ///
    /// Only network failures qualify. Cancellation, a clean end of stream, and
    /// caller bugs never trigger a reconnect.
    #[must_use]
    pub fn triggers_reconnect(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Stream { .. })
    }

    /// Whether a fresh attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { kind, .. } => *kind != ConnectionFailure::Tls,
            Self::Stream { kind, .. } => *kind != StreamFailure::Protocol,
            Self::Rpc { code, .. } => {
                matches!(code, StatusCode::Unavailable | StatusCode::DeadlineExceeded)
            },
            _ => false,
        }
    }

    pub(crate) fn connection(kind: ConnectionFailure, reason: impl fmt::Display) -> Self {
        Self::Connection { kind, reason: reason.to_string() }
    }

    pub(crate) fn stream(kind: StreamFailure, reason: impl fmt::Display) -> Self {
        Self::Stream { kind, reason: reason.to_string() }
    }
}

/// Classify an I/O error from a stream half.
impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset => StreamFailure::Reset,
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => StreamFailure::Protocol,
            _ => StreamFailure::ConnectionLost,
        };
        Self::stream(kind, err)
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        Self::stream(StreamFailure::Protocol, err)
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e.into(),
            CodecError::Protocol(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_stream_failures() {
        let reset: TransportError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        let eof: TransportError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        let pipe: TransportError = io::Error::from(io::ErrorKind::BrokenPipe).into();

        assert!(matches!(reset, TransportError::Stream { kind: StreamFailure::Reset, .. }));
        assert!(matches!(eof, TransportError::Stream { kind: StreamFailure::ConnectionLost, .. }));
        assert!(matches!(pipe, TransportError::Stream { kind: StreamFailure::ConnectionLost, .. }));
    }

    #[test]
    fn only_network_failures_trigger_reconnect() {
        assert!(TransportError::connection(ConnectionFailure::Dns, "nx").triggers_reconnect());
        assert!(TransportError::stream(StreamFailure::Reset, "rst").triggers_reconnect());

        for err in [
            TransportError::StreamEnded,
            TransportError::Cancelled,
            TransportError::SessionClosed,
            TransportError::AlreadyOpen(StreamKind::Update),
            TransportError::Rpc { code: StatusCode::Internal, message: String::new() },
        ] {
            assert!(!err.triggers_reconnect(), "{err:?}");
        }
    }

    #[test]
    fn kinds_group_errors_for_the_ui() {
        assert_eq!(TransportError::SessionClosed.kind(), ErrorKind::Cancelled);
        assert_eq!(TransportError::AlreadyOpen(StreamKind::State).kind(), ErrorKind::Misuse);
        assert_eq!(TransportError::StreamEnded.kind(), ErrorKind::StreamEnded);
    }

    #[test]
    fn tls_and_protocol_failures_are_not_transient() {
        assert!(!TransportError::connection(ConnectionFailure::Tls, "bad cert").is_transient());
        assert!(TransportError::connection(ConnectionFailure::Timeout, "slow").is_transient());
        assert!(!TransportError::stream(StreamFailure::Protocol, "junk").is_transient());
    }

    #[test]
    fn display_messages() {
        insta::assert_snapshot!(
            TransportError::AlreadyOpen(StreamKind::Update),
            @"update stream is already open on this session"
        );
        insta::assert_snapshot!(
            TransportError::connection(ConnectionFailure::Dns, "no such host"),
            @"connection failed (Dns): no such host"
        );
        insta::assert_snapshot!(
            TransportError::Rpc { code: StatusCode::DeadlineExceeded, message: "after 2s".into() },
            @"rpc failed (DeadlineExceeded): after 2s"
        );
        insta::assert_snapshot!(
            TransportError::InvalidEndpoint { input: "ftp://x".into(), reason: "only ssl:// is supported".into() },
            @r#"invalid endpoint "ftp://x": only ssl:// is supported"#
        );
    }
}
