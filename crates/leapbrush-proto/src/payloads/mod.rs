//! CBOR-encoded protocol messages.
//!
//! Headers are raw binary, payloads are CBOR. CBOR is self-describing and
//! tolerant of added fields, which lets headsets running an older build keep
//! talking to a newer server.
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Decoding an encoded payload with its own opcode yields an
//! equal value.

pub mod call;
pub mod device;
pub mod rpc;
pub mod state;
pub mod types;

use bytes::BufMut;
use serde::de::DeserializeOwned;

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All possible frame payloads
///
/// The payload type is determined by the `Opcode` in the frame header, so only
/// the inner struct is serialized (no variant tag in CBOR).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Opens a stream
    Call(call::Call),
    /// Closes the server half of a stream
    Status(call::Status),
    /// Device delta
    UpdateDevice(device::UpdateDeviceRequest),
    /// Update stream acknowledgement
    UpdateDeviceAck(device::UpdateDeviceResponse),
    /// Listener registration
    RegisterDevice(device::RegisterDeviceRequest),
    /// World-state snapshot
    ServerState(state::ServerStateResponse),
    /// Unary request
    RpcRequest(rpc::RpcRequest),
    /// Unary response
    RpcResponse(rpc::RpcResponse),
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Call(_) => Opcode::Call,
            Self::Status(_) => Opcode::Status,
            Self::UpdateDevice(_) => Opcode::UpdateDevice,
            Self::UpdateDeviceAck(_) => Opcode::UpdateDeviceAck,
            Self::RegisterDevice(_) => Opcode::RegisterDevice,
            Self::ServerState(_) => Opcode::ServerState,
            Self::RpcRequest(_) => Opcode::RpcRequest,
            Self::RpcResponse(_) => Opcode::RpcResponse,
        }
    }

    /// Encode the inner struct (not the variant tag) to `dst`.
    ///
    /// Size limits are enforced later by [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Call(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Status(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::UpdateDevice(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::UpdateDeviceAck(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RegisterDevice(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::ServerState(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RpcRequest(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::RpcResponse(inner) => ciborium::ser::into_writer(inner, &mut writer),
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload bytes according to `opcode`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        let payload = match opcode {
            Opcode::Call => Self::Call(from_cbor(bytes)?),
            Opcode::Status => Self::Status(from_cbor(bytes)?),
            Opcode::UpdateDevice => Self::UpdateDevice(from_cbor(bytes)?),
            Opcode::UpdateDeviceAck => Self::UpdateDeviceAck(from_cbor(bytes)?),
            Opcode::RegisterDevice => Self::RegisterDevice(from_cbor(bytes)?),
            Opcode::ServerState => Self::ServerState(from_cbor(bytes)?),
            Opcode::RpcRequest => Self::RpcRequest(from_cbor(bytes)?),
            Opcode::RpcResponse => Self::RpcResponse(from_cbor(bytes)?),
        };

        Ok(payload)
    }

    /// Encode into a transport frame with the matching opcode.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(Frame::new(FrameHeader::new(self.opcode()), buf))
    }

    /// Parse a payload from a raw transport frame.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the header opcode is not recognized
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
