//! Server error types.

use std::fmt;

use leapbrush_proto::CodecError;

use crate::world::WorldError;

/// Errors that can occur in the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, missing TLS certs, etc.).
    ///
    /// These are fatal errors that prevent server startup.
    Config(String),

    /// Transport/network error (connection failure, I/O error, etc.).
    ///
    /// Usually means the peer went away. Fatal for that stream only.
    Transport(String),

    /// Protocol error (malformed frame, frame out of order, etc.).
    ///
    /// The client sent something the stream layout does not allow. The stream
    /// is finished with an `InvalidArgument` trailer.
    Protocol(String),

    /// Rejected request content.
    World(WorldError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::World(err) => write!(f, "invalid request: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::World(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WorldError> for ServerError {
    fn from(err: WorldError) -> Self {
        Self::World(err)
    }
}

impl From<CodecError> for ServerError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => Self::Transport(io.to_string()),
            CodecError::Protocol(protocol) => Self::Protocol(protocol.to_string()),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
