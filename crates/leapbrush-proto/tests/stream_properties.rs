//! Property-based tests for framing a byte stream.
//!
//! A QUIC stream delivers bytes in arbitrary chunks. These tests write a
//! sequence of frames, re-chunk the bytes at random boundaries, and check the
//! reader recovers exactly the same frames in the same order.

use leapbrush_proto::{Frame, FrameHeader, Opcode, read_frame};
use proptest::prelude::*;
use tokio::io::AsyncWriteExt;

fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![
        Just(Opcode::Call),
        Just(Opcode::Status),
        Just(Opcode::UpdateDevice),
        Just(Opcode::UpdateDeviceAck),
        Just(Opcode::RegisterDevice),
        Just(Opcode::ServerState),
        Just(Opcode::RpcRequest),
        Just(Opcode::RpcResponse),
    ]
}

fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (arbitrary_opcode(), prop::collection::vec(any::<u8>(), 0..256))
        .prop_map(|(opcode, payload)| Frame::new(FrameHeader::new(opcode), payload))
}

fn read_all(wire: Vec<u8>, chunk: usize) -> Vec<Frame> {
    let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
    runtime.block_on(async move {
        let (mut tx, mut rx) = tokio::io::duplex(chunk);
        let writer = tokio::spawn(async move {
            for piece in wire.chunks(chunk) {
                tx.write_all(piece).await.expect("write");
            }
        });

        let mut frames = Vec::new();
        while let Some(frame) = read_frame(&mut rx).await.expect("read") {
            frames.push(frame);
        }
        writer.await.expect("join");
        frames
    })
}

proptest! {
    #[test]
    fn stream_preserves_frame_sequence(
        frames in prop::collection::vec(arbitrary_frame(), 0..12),
        chunk in 1usize..64,
    ) {
        let mut wire = Vec::new();
        for frame in &frames {
            frame.encode(&mut wire).expect("encode");
        }

        let read = read_all(wire, chunk);
        prop_assert_eq!(read, frames);
    }

    #[test]
    fn truncated_stream_never_yields_partial_frame(
        frames in prop::collection::vec(arbitrary_frame(), 1..6),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut wire = Vec::new();
        for frame in &frames {
            frame.encode(&mut wire).expect("encode");
        }
        let cut = cut.index(wire.len());

        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
        let complete = runtime.block_on(async {
            let mut reader: &[u8] = &wire[..cut];
            let mut complete = Vec::new();
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => complete.push(frame),
                    Ok(None) | Err(_) => break,
                }
            }
            complete
        });

        // Every frame produced is one of the originals, in order.
        prop_assert!(complete.len() <= frames.len());
        prop_assert_eq!(&complete[..], &frames[..complete.len()]);
    }
}
