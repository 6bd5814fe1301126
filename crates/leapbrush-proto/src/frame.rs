//! Frame type combining header and payload.
//!
//! A `Frame` is the transport-layer unit: the 12-byte header followed by
//! already-encoded payload bytes. For typed messages see
//! [`Payload::into_frame`](crate::Payload::into_frame) and
//! [`Payload::from_frame`](crate::Payload::from_frame).

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame
///
/// Layout on the wire: `[FrameHeader: 12 bytes] + [payload: variable]`.
///
/// # Invariants
///
/// - Size Consistency: `payload.len()` matches `header.payload_size()`.
///   Enforced by [`Frame::new`] and verified by [`Frame::decode`].
/// - Size Limit: frames whose payload exceeds
///   [`FrameHeader::MAX_PAYLOAD_SIZE`] are rejected by [`Frame::encode`] and
///   never produced by [`Frame::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Raw payload bytes (already CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame, setting the header's payload size from `payload`.
    ///
    /// Oversized payloads are accepted here and rejected by
    /// [`Frame::encode`].
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        header.payload_size = payload_len.to_be_bytes();

        Self { header, payload }
    }

    /// Total encoded size (header plus payload).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Encode frame into buffer.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds
    ///   [`FrameHeader::MAX_PAYLOAD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode one frame from the front of `bytes`.
    ///
    /// Trailing bytes beyond the announced payload are ignored. The payload is
    /// not deserialized.
    ///
    /// # Errors
    ///
    /// - Header errors from [`FrameHeader::from_bytes`]
    /// - `ProtocolError::FrameTruncated` if fewer payload bytes are present
    ///   than the header announces
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;
        let payload_size = header.payload_size() as usize;

        let payload = bytes.get(FrameHeader::SIZE..FrameHeader::SIZE + payload_size).ok_or(
            ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            },
        )?;

        #[cfg_attr(not(fuzzing), allow(unexpected_cfgs))]
        #[cfg(fuzzing)]
        {
            let _ = payload_size; // Proves we hit the success path
        }

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::Opcode;

    proptest! {
        #[test]
        fn frame_survives_encoding(opcode in any::<u16>(), payload in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut header = FrameHeader::new(Opcode::Call);
            header.opcode = opcode.to_be_bytes();
            let frame = Frame::new(header, payload);

            let mut wire = Vec::new();
            frame.encode(&mut wire).expect("should encode");
            prop_assert_eq!(wire.len(), frame.encoded_len());

            let parsed = Frame::decode(&wire).expect("should decode");
            prop_assert_eq!(frame, parsed);
        }
    }

    #[test]
    fn new_sets_payload_size() {
        let frame = Frame::new(FrameHeader::new(Opcode::UpdateDevice), vec![1, 2, 3, 4]);
        assert_eq!(frame.header.payload_size(), 4);
    }

    #[test]
    fn reject_truncated_frame() {
        let frame = Frame::new(FrameHeader::new(Opcode::UpdateDevice), vec![0u8; 100]);
        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        let result = Frame::decode(&wire[..FrameHeader::SIZE + 10]);
        assert_eq!(result, Err(ProtocolError::FrameTruncated { expected: 100, actual: 10 }));
    }

    #[test]
    fn reject_oversized_encode() {
        let payload = vec![0u8; FrameHeader::MAX_PAYLOAD_SIZE as usize + 1];
        let frame = Frame::new(FrameHeader::new(Opcode::ServerState), payload);

        let mut wire = Vec::new();
        assert!(matches!(frame.encode(&mut wire), Err(ProtocolError::PayloadTooLarge { .. })));
        assert!(wire.is_empty());
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let frame = Frame::new(FrameHeader::new(Opcode::Status), vec![9, 9]);
        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");
        wire.extend_from_slice(&[0xAA; 5]);

        let parsed = Frame::decode(&wire).expect("should decode");
        assert_eq!(parsed.payload.as_ref(), &[9, 9]);
    }
}
