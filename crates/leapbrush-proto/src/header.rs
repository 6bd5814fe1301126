//! Frame header with zero-copy parsing.
//!
//! The header is a fixed 12-byte big-endian structure. It is small enough to
//! read in one call and tells the reader exactly how many payload bytes follow,
//! so a stream can be split into frames without touching CBOR.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 12-byte frame header (big endian)
///
/// Fields are raw byte arrays so the struct has no alignment requirements and
/// can be cast directly from a network buffer.
///
/// # Security
///
/// Every 12-byte pattern is a valid `FrameHeader` value, so casting untrusted
/// bytes is sound. Semantic checks (magic, version, size limit) happen in
/// [`FrameHeader::from_bytes`] before any payload memory is allocated.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    magic: [u8; 4],                   // 0x4C425253 ("LBRS")
    version: u8,                      // 0x01
    reserved: u8,                     // written as zero, ignored on read
    pub(crate) opcode: [u8; 2],       // u16 operation code
    pub(crate) payload_size: [u8; 4], // u32 payload length
}

impl FrameHeader {
    /// Size of the serialized header
    pub const SIZE: usize = 12;

    /// Magic number: "LBRS" in ASCII
    pub const MAGIC: u32 = 0x4C42_5253;

    /// Current protocol version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (4 MiB)
    ///
    /// The server sends at most one brush stroke per snapshot, so even large
    /// strokes stay far below this.
    pub const MAX_PAYLOAD_SIZE: u32 = 4 * 1024 * 1024;

    /// Create a header for `opcode` with an empty payload.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            magic: Self::MAGIC.to_be_bytes(),
            version: Self::VERSION,
            reserved: 0,
            opcode: opcode.to_u16().to_be_bytes(),
            payload_size: [0; 4],
        }
    }

    /// Parse a header from the front of `bytes` without copying.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if fewer than 12 bytes are available
    /// - `ProtocolError::InvalidMagic` if the magic number does not match
    /// - `ProtocolError::UnsupportedVersion` for any other protocol version
    /// - `ProtocolError::PayloadTooLarge` if the announced payload exceeds
    ///   [`Self::MAX_PAYLOAD_SIZE`]
    ///
    /// The opcode is not validated here. Unknown opcodes are rejected when the
    /// payload is decoded, so a reader can still skip over them.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Protocol version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("payload_size", &self.payload_size())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for FrameHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (any::<u16>(), any::<u8>(), 0u32..=Self::MAX_PAYLOAD_SIZE)
                .prop_map(|(opcode, reserved, payload_size)| Self {
                    magic: Self::MAGIC.to_be_bytes(),
                    version: Self::VERSION,
                    reserved,
                    opcode: opcode.to_be_bytes(),
                    payload_size: payload_size.to_be_bytes(),
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
        assert_eq!(FrameHeader::SIZE, 12);
    }

    #[test]
    fn new_header_is_valid() {
        let header = FrameHeader::new(Opcode::ServerState);
        let bytes = header.to_bytes();

        assert_eq!(&bytes[0..4], b"LBRS");
        let parsed = FrameHeader::from_bytes(&bytes).expect("should parse");
        assert_eq!(parsed.opcode_enum(), Some(Opcode::ServerState));
        assert_eq!(parsed.payload_size(), 0);
    }

    proptest! {
        #[test]
        fn header_parses_back(header in any::<FrameHeader>()) {
            let bytes = header.to_bytes();
            let parsed = FrameHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..32)) {
            let _ = FrameHeader::from_bytes(&bytes);
        }
    }

    #[test]
    fn reject_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 7]);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 12, actual: 7 }));
    }

    #[test]
    fn reject_invalid_magic() {
        let mut buf = FrameHeader::new(Opcode::Call).to_bytes();
        buf[0] = 0xFF;

        assert_eq!(FrameHeader::from_bytes(&buf), Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn reject_invalid_version() {
        let mut buf = FrameHeader::new(Opcode::Call).to_bytes();
        buf[4] = 0x02;

        assert_eq!(FrameHeader::from_bytes(&buf), Err(ProtocolError::UnsupportedVersion(0x02)));
    }

    #[test]
    fn reject_oversized_payload() {
        let mut buf = FrameHeader::new(Opcode::Call).to_bytes();
        buf[8..12].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());

        assert!(matches!(
            FrameHeader::from_bytes(&buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn reserved_byte_is_ignored() {
        let mut buf = FrameHeader::new(Opcode::Status).to_bytes();
        buf[5] = 0xAB;

        let parsed = FrameHeader::from_bytes(&buf).expect("should parse");
        assert_eq!(parsed.opcode_enum(), Some(Opcode::Status));
    }
}
