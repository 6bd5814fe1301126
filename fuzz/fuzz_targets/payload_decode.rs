//! Fuzz target for Payload::decode
//!
//! Feeds the same bytes to the CBOR decoder of every opcode:
//! - Malformed CBOR
//! - Payloads of one message type read as another
//! - Oversized strings and collections
//!
//! Every invalid input must come back as an error.

#![no_main]

use leapbrush_proto::{Opcode, Payload};
use libfuzzer_sys::fuzz_target;

const OPCODES: [Opcode; 8] = [
    Opcode::Call,
    Opcode::Status,
    Opcode::UpdateDevice,
    Opcode::UpdateDeviceAck,
    Opcode::RegisterDevice,
    Opcode::ServerState,
    Opcode::RpcRequest,
    Opcode::RpcResponse,
];

fuzz_target!(|data: &[u8]| {
    for opcode in OPCODES {
        if let Ok(payload) = Payload::decode(opcode, data) {
            assert_eq!(payload.opcode(), opcode);

            // Whatever decodes must encode again.
            let mut wire = Vec::new();
            payload.encode(&mut wire).expect("decoded payload re-encodes");
        }
    }
});
