//! LeapBrush wire protocol.
//!
//! Every RPC runs on its own bidirectional stream and every message on that
//! stream is a [`Frame`]: a fixed 12-byte binary header followed by a CBOR
//! payload whose schema is selected by the header's [`Opcode`].
//!
//! # Stream layout
//!
//! ```text
//! client -> server:  Call{method}  request*  FIN
//! server -> client:  response*     Status    FIN
//! ```
//!
//! - `UpdateDeviceStream`: zero or more `UpdateDevice` frames, answered by one
//!   `UpdateDeviceAck` once the client finishes its half.
//! - `RegisterAndListen`: one `RegisterDevice` frame, answered by an unbounded
//!   sequence of `ServerState` snapshots.
//! - `Rpc`: one `RpcRequest`, answered by one `RpcResponse`.
//!
//! The `Status` trailer is mandatory. A stream that reaches EOF before its
//! trailer was cut off, not finished.
//!
//! # Components
//!
//! - [`FrameHeader`]: zero-copy header parsing
//! - [`Frame`]: header plus raw payload bytes
//! - [`Payload`]: typed CBOR messages, one variant per opcode
//! - [`codec`]: async frame reader/writer over tokio I/O

pub mod codec;
mod errors;
mod frame;
mod header;
mod opcode;
pub mod payloads;

pub use codec::{CodecError, read_frame, read_payload, write_frame, write_payload};
pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use opcode::Opcode;
pub use payloads::Payload;

/// ALPN protocol identifier negotiated during the TLS handshake.
pub const ALPN_PROTOCOL: &[u8] = b"leapbrush";

/// Port used when an endpoint string does not name one.
pub const DEFAULT_PORT: u16 = 8402;
