//! Inbound state channel.
//!
//! # State machine
//!
//! ```text
//!          snapshot
//!        ┌─────────┐
//!        ↓         │
//!   ┌──────────┐───┘   OK trailer    ┌───────┐
//!   │   Open   │────────────────────>│ Ended │
//!   └──────────┘                     └───────┘
//!     │      │  error trailer / I/O  ┌────────┐
//!     │      └──────────────────────>│ Failed │
//!     │ cancel                       └────────┘
//!     ↓
//!   ┌───────────┐
//!   │ Cancelled │
//!   └───────────┘
//! ```
//!
//! Terminal states drop the stream and repeat their outcome on every later
//! call.

use std::fmt;

use leapbrush_proto::{
    Payload, codec,
    payloads::state::{ServerInfo, ServerStateResponse},
};

use crate::{
    CancelToken, RecvHalf, Session, TransportError,
    error::StreamFailure,
    session::{OpenSlot, cut_off, unexpected},
};

#[derive(Debug)]
enum ListenState {
    Open,
    Ended,
    Cancelled,
    Failed(TransportError),
}

/// Server-streaming channel delivering world-state snapshots.
///
/// Every [`read_next`](Self::read_next) returns a freshly decoded, owned
/// value; nothing is shared with earlier results. Reads are serialized by
/// `&mut self`.
pub struct ServerStateStream {
    session: Session,
    state: ListenState,
    recv: Option<RecvHalf>,
    slot: Option<OpenSlot>,
    server_info: Option<ServerInfo>,
    received: u64,
}

impl ServerStateStream {
    pub(crate) fn new(session: Session, recv: RecvHalf, slot: OpenSlot) -> Self {
        Self {
            session,
            state: ListenState::Open,
            recv: Some(recv),
            slot: Some(slot),
            server_info: None,
            received: 0,
        }
    }

    /// Wait for the next snapshot.
    ///
    /// Empty keepalive snapshots are returned like any other.
    ///
    /// # Errors
    ///
    /// - `StreamEnded` once the server finished the stream with an OK trailer
    /// - `Stream { kind: Aborted }` for an error trailer
    /// - `Stream { kind: ConnectionLost }` if the stream stops without a
    ///   trailer
    /// - `Cancelled` if `cancel` fires during the read
    /// - `SessionClosed` once the session is closing
    pub async fn read_next(
        &mut self,
        cancel: &CancelToken,
    ) -> Result<ServerStateResponse, TransportError> {
        match &self.state {
            ListenState::Open => {},
            ListenState::Ended => return Err(TransportError::StreamEnded),
            ListenState::Cancelled => return Err(TransportError::Cancelled),
            ListenState::Failed(err) => return Err(err.clone()),
        }
        let Some(recv) = self.recv.as_mut() else {
            return Err(TransportError::SessionClosed);
        };

        match self.session.run(cancel, read_snapshot(recv)).await {
            Ok(snapshot) => {
                self.received += 1;
                if self.server_info.is_none() {
                    self.server_info.clone_from(&snapshot.server_info);
                }
                tracing::trace!(
                    seq = self.received,
                    users = snapshot.user_states.len(),
                    strokes = snapshot.brush_stroke_adds.len(),
                    "snapshot received"
                );
                Ok(snapshot)
            },
            Err(err) => Err(self.finish(err)),
        }
    }

    /// Server identification from the first snapshot that carried it.
    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Number of snapshots received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Whether reads can still return snapshots.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, ListenState::Open)
    }

    fn finish(&mut self, err: TransportError) -> TransportError {
        self.state = match err {
            TransportError::StreamEnded => {
                tracing::debug!(received = self.received, "state stream ended by server");
                ListenState::Ended
            },
            TransportError::Cancelled => {
                tracing::debug!(received = self.received, "state stream cancelled");
                ListenState::Cancelled
            },
            TransportError::SessionClosed => {
                tracing::debug!(received = self.received, "state stream closed with its session");
                ListenState::Failed(TransportError::SessionClosed)
            },
            ref other => {
                tracing::warn!(received = self.received, error = %other, "state stream failed");
                ListenState::Failed(other.clone())
            },
        };
        self.recv = None;
        self.slot = None;
        err
    }
}

impl fmt::Debug for ServerStateStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStateStream")
            .field("generation", &self.session.generation())
            .field("state", &self.state)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

async fn read_snapshot(recv: &mut RecvHalf) -> Result<ServerStateResponse, TransportError> {
    match codec::read_payload(recv).await? {
        Some(Payload::ServerState(snapshot)) => Ok(snapshot),
        Some(Payload::Status(status)) if status.is_ok() => Err(TransportError::StreamEnded),
        Some(Payload::Status(status)) => Err(TransportError::stream(
            StreamFailure::Aborted,
            format!("{}: {}", status.code, status.message),
        )),
        Some(other) => Err(unexpected("ServerState", &other)),
        None => Err(cut_off()),
    }
}
