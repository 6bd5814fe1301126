//! Outbound update channel.

use std::fmt;

use leapbrush_proto::{
    Payload, codec,
    payloads::device::{UpdateDeviceRequest, UpdateDeviceResponse},
};
use tokio::io::AsyncWriteExt;

use crate::{
    CancelToken, RecvHalf, SendHalf, Session, TransportError,
    error::StreamFailure,
    session::{OpenSlot, cut_off, unexpected},
};

#[derive(Debug)]
enum ChannelState {
    Open,
    Cancelled,
    Failed(TransportError),
}

/// Client-streaming channel carrying device deltas to the server.
///
/// One frame per [`write`](Self::write), in call order. `&mut self` rules
/// out concurrent writes on the same channel. Once a write is cancelled or
/// fails the channel is finished: later writes repeat the outcome and the
/// session slot is released so a fresh channel can be opened.
pub struct UpdateDeviceStream {
    session: Session,
    state: ChannelState,
    io: Option<(SendHalf, RecvHalf)>,
    slot: Option<OpenSlot>,
    sent: u64,
}

impl UpdateDeviceStream {
    pub(crate) fn new(session: Session, send: SendHalf, recv: RecvHalf, slot: OpenSlot) -> Self {
        Self {
            session,
            state: ChannelState::Open,
            io: Some((send, recv)),
            slot: Some(slot),
            sent: 0,
        }
    }

    /// Send one update.
    ///
    /// # Errors
    ///
    /// - `Cancelled` if `cancel` fires before the frame is written, and on
    ///   every call after that
    /// - `SessionClosed` once the session is closing
    /// - `Stream` if the stream or connection failed; repeated afterwards
    pub async fn write(
        &mut self,
        update: UpdateDeviceRequest,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Some((send, _)) = self.io.as_mut() else {
            return Err(TransportError::SessionClosed);
        };

        let result = self
            .session
            .run(cancel, async {
                codec::write_payload(send, Payload::UpdateDevice(update)).await?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                self.sent += 1;
                tracing::trace!(seq = self.sent, "update written");
                Ok(())
            },
            Err(err) => Err(self.finish(err)),
        }
    }

    /// Finish the client half and wait for the server's acknowledgement.
    ///
    /// Returns `None` when the server ends the stream cleanly without an
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// The channel's terminal error if it already failed, otherwise as for
    /// [`write`](Self::write), plus `Stream { kind: Aborted }` for an error
    /// trailer.
    pub async fn close(
        mut self,
        cancel: &CancelToken,
    ) -> Result<Option<UpdateDeviceResponse>, TransportError> {
        self.ensure_open()?;
        let Some((mut send, mut recv)) = self.io.take() else {
            return Err(TransportError::SessionClosed);
        };

        let result = self
            .session
            .run(cancel, async {
                send.shutdown().await?;
                read_ack(&mut recv).await
            })
            .await;

        tracing::debug!(sent = self.sent, ok = result.is_ok(), "update stream closed");
        result
    }

    /// Number of updates written so far.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether writes can still succeed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open)
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        match &self.state {
            ChannelState::Open => Ok(()),
            ChannelState::Cancelled => Err(TransportError::Cancelled),
            ChannelState::Failed(err) => Err(err.clone()),
        }
    }

    /// Move to a terminal state and release the stream and slot.
    fn finish(&mut self, err: TransportError) -> TransportError {
        self.state = match err {
            TransportError::Cancelled => {
                tracing::debug!(sent = self.sent, "update stream cancelled");
                ChannelState::Cancelled
            },
            TransportError::SessionClosed => {
                tracing::debug!(sent = self.sent, "update stream closed with its session");
                ChannelState::Failed(TransportError::SessionClosed)
            },
            ref other => {
                tracing::warn!(sent = self.sent, error = %other, "update stream failed");
                ChannelState::Failed(other.clone())
            },
        };
        self.io = None;
        self.slot = None;
        err
    }
}

impl fmt::Debug for UpdateDeviceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateDeviceStream")
            .field("generation", &self.session.generation())
            .field("state", &self.state)
            .field("sent", &self.sent)
            .finish_non_exhaustive()
    }
}

async fn read_ack(recv: &mut RecvHalf) -> Result<Option<UpdateDeviceResponse>, TransportError> {
    let ack = match codec::read_payload(recv).await? {
        Some(Payload::UpdateDeviceAck(ack)) => Some(ack),
        Some(Payload::Status(status)) if status.is_ok() => return Ok(None),
        Some(Payload::Status(status)) => {
            return Err(TransportError::stream(
                StreamFailure::Aborted,
                format!("{}: {}", status.code, status.message),
            ));
        },
        Some(other) => return Err(unexpected("UpdateDeviceAck", &other)),
        None => return Err(cut_off()),
    };

    match codec::read_payload(recv).await? {
        Some(Payload::Status(status)) if status.is_ok() => Ok(ack),
        Some(Payload::Status(status)) => Err(TransportError::stream(
            StreamFailure::Aborted,
            format!("{}: {}", status.code, status.message),
        )),
        Some(other) => Err(unexpected("Status", &other)),
        None => Err(cut_off()),
    }
}

#[cfg(test)]
mod tests {
    use leapbrush_proto::payloads::{
        call::{Call, Method, Status, StatusCode},
        types::UserState,
    };

    use super::*;
    use crate::{
        Scheme, ServerEndpoint, TransportConfig,
        loopback::{MemoryPeer, memory_transport},
    };

    async fn connected() -> (Session, MemoryPeer) {
        let (connector, mut listener) = memory_transport();
        let endpoint = ServerEndpoint::new(Scheme::Plaintext, "loopback", 8402);
        let session = Session::connect(&connector, endpoint, TransportConfig::development())
            .await
            .expect("connect");
        let peer = listener.accept().await.expect("peer");
        (session, peer)
    }

    fn update(user: &str) -> UpdateDeviceRequest {
        UpdateDeviceRequest {
            user_state: UserState { user_name: user.into(), ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_arrive_after_call_and_close_reads_ack() {
        let (session, mut peer) = connected().await;
        let cancel = CancelToken::new();
        let mut stream = session.open_update_stream(&cancel).await.expect("open");

        stream.write(update("a"), &cancel).await.expect("write");
        stream.write(update("b"), &cancel).await.expect("write");
        assert_eq!(stream.sent(), 2);

        let (mut send, mut recv) = peer.accept_bi().await.expect("stream");
        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(payload) = codec::read_payload(&mut recv).await.expect("read") {
                seen.push(payload);
            }
            codec::write_payload(&mut send, Payload::UpdateDeviceAck(UpdateDeviceResponse {}))
                .await
                .expect("ack");
            codec::write_payload(&mut send, Payload::Status(Status::ok())).await.expect("ok");
            seen
        });

        let ack = stream.close(&cancel).await.expect("close");
        assert_eq!(ack, Some(UpdateDeviceResponse {}));

        let seen = server.await.expect("join");
        assert_eq!(seen, vec![
            Payload::Call(Call { method: Method::UpdateDeviceStream }),
            Payload::UpdateDevice(update("a")),
            Payload::UpdateDevice(update("b")),
        ]);
    }

    #[tokio::test]
    async fn cancelled_channel_stays_cancelled_and_frees_slot() {
        let (session, _peer) = connected().await;
        let cancel = CancelToken::new();
        let mut stream = session.open_update_stream(&cancel).await.expect("open");

        let cancelled = cancel.child();
        cancelled.cancel();
        let err = stream.write(update("a"), &cancelled).await.expect_err("cancelled");
        assert_eq!(err, TransportError::Cancelled);
        assert!(!stream.is_open());

        let err = stream.write(update("a"), &cancel).await.expect_err("still cancelled");
        assert_eq!(err, TransportError::Cancelled);

        let replacement = session.open_update_stream(&cancel).await;
        assert!(replacement.is_ok(), "slot should be free: {replacement:?}");
    }

    #[tokio::test]
    async fn error_trailer_on_close_is_aborted() {
        let (session, mut peer) = connected().await;
        let cancel = CancelToken::new();
        let stream = session.open_update_stream(&cancel).await.expect("open");

        let (mut send, _recv) = peer.accept_bi().await.expect("stream");
        let status = Status::error(StatusCode::Internal, "boom");
        codec::write_payload(&mut send, Payload::Status(status)).await.expect("write");

        let err = stream.close(&cancel).await.expect_err("aborted");
        assert!(matches!(err, TransportError::Stream { kind: StreamFailure::Aborted, .. }));
    }

    #[tokio::test]
    async fn session_close_fails_later_writes() {
        let (session, _peer) = connected().await;
        let cancel = CancelToken::new();
        let mut stream = session.open_update_stream(&cancel).await.expect("open");

        session.close_and_wait().await;

        let err = stream.write(update("a"), &cancel).await.expect_err("closed");
        assert_eq!(err, TransportError::SessionClosed);
        let err = stream.write(update("a"), &cancel).await.expect_err("closed");
        assert_eq!(err, TransportError::SessionClosed);
        assert_eq!(
            session.open_update_stream(&cancel).await.expect_err("closed"),
            TransportError::SessionClosed
        );
    }
}
