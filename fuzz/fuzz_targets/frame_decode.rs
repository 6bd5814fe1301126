//! Fuzz target for Frame::decode
//!
//! Arbitrary bytes as a frame. Looks for:
//! - Parser panics
//! - Size arithmetic overflows
//! - Headers that slip past validation
//!
//! Every invalid input must come back as an error.

#![no_main]

use leapbrush_proto::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        assert_eq!(frame.payload.len(), frame.header.payload_size() as usize);
    }
});
