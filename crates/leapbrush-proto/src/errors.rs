//! Protocol errors.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Structural failures while framing or decoding messages.
///
/// None of these are transient: a peer that produces one is either broken or
/// speaking another protocol version.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than a frame header
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Payload shorter than the header claims
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload bytes announced by the header
        expected: usize,
        /// Payload bytes available
        actual: usize,
    },

    /// Header does not start with the protocol magic
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header carries a version this build cannot read
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds the protocol limit
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Announced or actual size
        size: usize,
        /// Protocol maximum
        max: usize,
    },

    /// Opcode not known to this build
    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u16),

    /// Frame arrived where the stream layout does not allow it
    #[error("unexpected frame: expected {expected}, got {actual:?}")]
    UnexpectedFrame {
        /// What the reader was waiting for
        expected: &'static str,
        /// Opcode that actually arrived
        actual: crate::Opcode,
    },

    /// CBOR serialization failed
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR deserialization failed
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
