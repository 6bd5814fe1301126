//! Fuzz target for frame header boundary conditions
//!
//! # Strategy
//!
//! - Magic: valid, off-by-one, all-zeros, all-ones, random
//! - Version: valid, zero, max, random
//! - Payload size: zero, small, at max, just over max, `u32::MAX`
//!
//! # Invariants
//!
//! - Sizes over `MAX_PAYLOAD_SIZE` never decode
//! - A wrong magic never decodes
//! - Encoded size is always header plus payload

#![no_main]

use arbitrary::Arbitrary;
use leapbrush_proto::{Frame, FrameHeader, Opcode};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    magic: MagicBytes,
    version: VersionByte,
    reserved: u8,
    opcode: u16,
    payload_size: PayloadSize,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    AllOnes,
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionByte {
    Valid,
    Zero,
    Max,
    Random(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Zero,
    Small(u8),
    AtMax,
    JustOverMax,
    MaxU32,
    Random(u32),
}

fuzz_target!(|boundary: BoundaryFrame| {
    let size = match boundary.payload_size {
        PayloadSize::Zero => 0,
        PayloadSize::Small(s) => u32::from(s),
        PayloadSize::AtMax => FrameHeader::MAX_PAYLOAD_SIZE,
        PayloadSize::JustOverMax => FrameHeader::MAX_PAYLOAD_SIZE.saturating_add(1),
        PayloadSize::MaxU32 => u32::MAX,
        PayloadSize::Random(r) => r,
    };

    let present = size.min(100_000) as usize;
    let mut buffer = vec![0u8; FrameHeader::SIZE + present];

    let magic = FrameHeader::MAGIC.to_be_bytes();
    match boundary.magic {
        MagicBytes::Valid => buffer[0..4].copy_from_slice(&magic),
        MagicBytes::OffByOne(offset) => {
            buffer[0..4].copy_from_slice(&magic);
            let idx = (offset % 4) as usize;
            buffer[idx] = buffer[idx].wrapping_add(1);
        },
        MagicBytes::AllZeros => buffer[0..4].fill(0),
        MagicBytes::AllOnes => buffer[0..4].fill(0xFF),
        MagicBytes::Random(bytes) => buffer[0..4].copy_from_slice(&bytes),
    }
    buffer[4] = match boundary.version {
        VersionByte::Valid => FrameHeader::VERSION,
        VersionByte::Zero => 0,
        VersionByte::Max => u8::MAX,
        VersionByte::Random(v) => v,
    };
    buffer[5] = boundary.reserved;
    buffer[6..8].copy_from_slice(&boundary.opcode.to_be_bytes());
    buffer[8..12].copy_from_slice(&size.to_be_bytes());

    if let Ok(frame) = Frame::decode(&buffer) {
        assert_eq!(buffer[0..4], magic);
        assert!(size <= FrameHeader::MAX_PAYLOAD_SIZE);
        assert_eq!(frame.header.payload_size(), size);
        assert_eq!(frame.header.opcode(), boundary.opcode);
    }

    if let Some(opcode) = Opcode::from_u16(boundary.opcode) {
        let frame = Frame::new(FrameHeader::new(opcode), vec![0xAA; present.min(1000)]);

        let mut encoded = Vec::new();
        if frame.encode(&mut encoded).is_err() {
            return;
        }
        assert_eq!(encoded.len(), FrameHeader::SIZE + frame.payload.len());

        let decoded = Frame::decode(&encoded).expect("encoded frame decodes");
        assert_eq!(decoded, frame);
    }
});
