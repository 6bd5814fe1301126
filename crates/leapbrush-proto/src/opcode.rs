//! Frame operation codes.

/// Operation code carried in every frame header.
///
/// The opcode alone decides how the payload is decoded; payloads carry no
/// variant tag of their own.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// First client frame on a stream, names the RPC method
    Call = 0x0001,
    /// Final server frame on a stream, carries the call outcome
    Status = 0x0002,

    /// One device/drawing delta on an update stream
    UpdateDevice = 0x0010,
    /// Terminal acknowledgement of an update stream
    UpdateDeviceAck = 0x0011,

    /// Registration that opens a listen stream
    RegisterDevice = 0x0020,
    /// One merged world-state snapshot
    ServerState = 0x0021,

    /// Unary request
    RpcRequest = 0x0030,
    /// Unary response
    RpcResponse = 0x0031,
}

impl Opcode {
    /// Raw wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a raw wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Call),
            0x0002 => Some(Self::Status),
            0x0010 => Some(Self::UpdateDevice),
            0x0011 => Some(Self::UpdateDeviceAck),
            0x0020 => Some(Self::RegisterDevice),
            0x0021 => Some(Self::ServerState),
            0x0030 => Some(Self::RpcRequest),
            0x0031 => Some(Self::RpcResponse),
            _ => None,
        }
    }
}
