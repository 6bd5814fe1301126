//! Async frame reader and writer.
//!
//! Works on any tokio byte stream, so the same code runs over QUIC streams and
//! in-memory pipes. The reader distinguishes a clean end of stream (EOF on a
//! frame boundary) from a stream that was cut off mid-frame.

use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Frame, FrameHeader, Payload, ProtocolError};

/// Failure while reading or writing frames.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Underlying stream failed or ended mid-frame
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bytes on the stream are not a valid frame
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Read the next frame.
///
/// Returns `Ok(None)` when the peer finished the stream exactly on a frame
/// boundary.
///
/// # Errors
///
/// - `CodecError::Io` with `UnexpectedEof` if the stream ends inside a frame
/// - `CodecError::Io` for any other read failure
/// - `CodecError::Protocol` if the header is invalid
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; FrameHeader::SIZE];
    let mut filled = 0;
    while filled < FrameHeader::SIZE {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {filled} header bytes"),
            )
            .into());
        }
        filled += n;
    }

    let header = *FrameHeader::from_bytes(&header_buf)?;

    let mut payload = vec![0u8; header.payload_size() as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame { header, payload: Bytes::from(payload) }))
}

/// Read the next frame and decode its payload.
///
/// # Errors
///
/// As [`read_frame`], plus `CodecError::Protocol` if the payload does not
/// decode.
pub async fn read_payload<R>(reader: &mut R) -> Result<Option<Payload>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(Payload::from_frame(&frame)?)),
        None => Ok(None),
    }
}

/// Write one frame and flush it.
///
/// # Errors
///
/// - `CodecError::Protocol` if the frame is oversized
/// - `CodecError::Io` if the stream rejects the write
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(frame.encoded_len());
    frame.encode(&mut buf)?;

    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}

/// Encode `payload` and write it as one frame.
///
/// # Errors
///
/// As [`write_frame`], plus `CodecError::Protocol` if encoding fails.
pub async fn write_payload<W>(writer: &mut W, payload: Payload) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = payload.into_frame()?;
    write_frame(writer, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Opcode,
        payloads::call::{Call, Method, Status},
    };

    #[tokio::test]
    async fn frames_arrive_in_order_then_clean_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            write_payload(&mut client, Payload::Call(Call { method: Method::Rpc })).await?;
            write_payload(&mut client, Payload::Status(Status::ok())).await?;
            client.shutdown().await?;
            Ok::<_, CodecError>(())
        });

        let first = read_payload(&mut server).await.expect("read").expect("frame");
        let second = read_payload(&mut server).await.expect("read").expect("frame");
        let end = read_payload(&mut server).await.expect("read");

        assert_eq!(first, Payload::Call(Call { method: Method::Rpc }));
        assert_eq!(second, Payload::Status(Status::ok()));
        assert!(end.is_none());
        writer.await.expect("join").expect("write");
    }

    #[tokio::test]
    async fn eof_inside_header_is_an_error() {
        let bytes = FrameHeader::new(Opcode::Status).to_bytes();
        let mut reader: &[u8] = &bytes[..5];

        let err = read_frame(&mut reader).await.expect_err("should fail");
        assert!(matches!(err, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn eof_inside_payload_is_an_error() {
        let frame = Frame::new(FrameHeader::new(Opcode::ServerState), vec![7u8; 32]);
        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("encode");
        let mut reader: &[u8] = &wire[..20];

        let err = read_frame(&mut reader).await.expect_err("should fail");
        assert!(matches!(err, CodecError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn bad_magic_is_a_protocol_error() {
        let mut reader: &[u8] = &[0u8; 16];

        let err = read_frame(&mut reader).await.expect_err("should fail");
        assert!(matches!(err, CodecError::Protocol(ProtocolError::InvalidMagic)));
    }

    #[tokio::test]
    async fn byte_at_a_time_reader_still_frames() {
        let frame = Payload::Status(Status::ok()).into_frame().expect("encode");
        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("encode");

        let (mut tx, mut rx) = tokio::io::duplex(1);
        tokio::spawn(async move {
            tx.write_all(&wire).await.expect("write");
        });

        let read = read_frame(&mut rx).await.expect("read").expect("frame");
        assert_eq!(read, frame);
    }
}
