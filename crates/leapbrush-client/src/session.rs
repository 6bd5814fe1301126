//! Transport session: one connection, at most one channel of each kind.
//!
//! # Shutdown
//!
//! Every channel operation runs while holding the session gate shared.
//! [`Session::close_and_wait`] cancels the session token, takes the gate
//! exclusively (which waits for in-flight operations to observe the
//! cancellation and unwind), then closes the connection. Operations started
//! afterwards see the cancelled token before touching the connection and fail
//! with [`TransportError::SessionClosed`].

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use leapbrush_proto::{
    Payload, codec,
    payloads::{
        call::{Call, Method, StatusCode},
        device::RegisterDeviceRequest,
        rpc::{RpcRequest, RpcResponse},
    },
};
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, RwLock},
};

use crate::{
    CancelToken, Connection, Connector, RecvHalf, ServerEndpoint, ServerStateStream,
    TransportConfig, TransportError, UpdateDeviceStream,
    error::{ConnectionFailure, StreamFailure, StreamKind},
};

/// Caller-facing capabilities of a connected session.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Server this session is connected to.
    fn endpoint(&self) -> &ServerEndpoint;

    /// Open the outbound update channel.
    async fn open_update_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<UpdateDeviceStream, TransportError>;

    /// Register for and open the inbound state channel.
    async fn open_state_stream(
        &self,
        request: RegisterDeviceRequest,
        cancel: &CancelToken,
    ) -> Result<ServerStateStream, TransportError>;

    /// Issue one unary call.
    async fn rpc(&self, request: RpcRequest, cancel: &CancelToken)
    -> Result<RpcResponse, TransportError>;

    /// Cancel outstanding operations and release the connection.
    async fn close_and_wait(&self);
}

/// A connected session. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    endpoint: ServerEndpoint,
    config: TransportConfig,
    connection: Box<dyn Connection>,
    /// Cancelled exactly once, by `close_and_wait`.
    cancel: CancelToken,
    gate: RwLock<()>,
    update_open: Arc<AtomicBool>,
    state_open: Arc<AtomicBool>,
    /// Serializes `close_and_wait`; true once the connection is released.
    closed: Mutex<bool>,
    generation: u64,
}

impl Session {
    /// Connect to `endpoint`.
    ///
    /// # Errors
    ///
    /// `TransportError::Connection` classified by cause, including `Timeout`
    /// when resolution plus handshake exceed `config.connect_timeout`.
    pub async fn connect<C>(
        connector: &C,
        endpoint: ServerEndpoint,
        config: TransportConfig,
    ) -> Result<Self, TransportError>
    where
        C: Connector + ?Sized,
    {
        Self::establish(connector, endpoint, config, 0).await
    }

    pub(crate) async fn establish<C>(
        connector: &C,
        endpoint: ServerEndpoint,
        config: TransportConfig,
        generation: u64,
    ) -> Result<Self, TransportError>
    where
        C: Connector + ?Sized,
    {
        let limit = config.connect_timeout;
        let connection = tokio::time::timeout(limit, connector.connect(&endpoint, &config))
            .await
            .map_err(|_| {
                TransportError::connection(
                    ConnectionFailure::Timeout,
                    format!("no handshake within {limit:?}"),
                )
            })??;

        tracing::info!(%endpoint, generation, "session connected");

        Ok(Self {
            inner: Arc::new(SessionInner {
                endpoint,
                config,
                connection,
                cancel: CancelToken::new(),
                gate: RwLock::new(()),
                update_open: Arc::new(AtomicBool::new(false)),
                state_open: Arc::new(AtomicBool::new(false)),
                closed: Mutex::new(false),
                generation,
            }),
        })
    }

    /// Server this session is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.inner.endpoint
    }

    /// Sequence number assigned by the lifecycle that created this session.
    /// Sessions created with [`Session::connect`] are generation 0.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Whether `close_and_wait` has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Open the outbound update channel.
    ///
    /// # Errors
    ///
    /// - `AlreadyOpen(Update)` while a previous update channel is alive
    /// - `SessionClosed` after `close_and_wait`
    /// - `Cancelled` if `cancel` fires first
    /// - `Stream` if the connection is gone
    pub async fn open_update_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<UpdateDeviceStream, TransportError> {
        self.ensure_open()?;
        let slot = OpenSlot::claim(&self.inner.update_open, StreamKind::Update)?;

        let (send, recv) = self
            .run(cancel, async {
                let (mut send, recv) = self.inner.connection.open_bi().await?;
                let call = Call { method: Method::UpdateDeviceStream };
                codec::write_payload(&mut send, Payload::Call(call)).await?;
                Ok((send, recv))
            })
            .await?;

        tracing::debug!(generation = self.generation(), "update stream opened");
        Ok(UpdateDeviceStream::new(self.clone(), send, recv, slot))
    }

    /// Register with the server and open the inbound state channel.
    ///
    /// # Errors
    ///
    /// As [`open_update_stream`](Self::open_update_stream), with
    /// `AlreadyOpen(State)`.
    pub async fn open_state_stream(
        &self,
        request: RegisterDeviceRequest,
        cancel: &CancelToken,
    ) -> Result<ServerStateStream, TransportError> {
        self.ensure_open()?;
        let slot = OpenSlot::claim(&self.inner.state_open, StreamKind::State)?;
        let user = request.user_name.clone();

        let recv = self
            .run(cancel, async {
                let (mut send, recv) = self.inner.connection.open_bi().await?;
                let call = Call { method: Method::RegisterAndListen };
                codec::write_payload(&mut send, Payload::Call(call)).await?;
                codec::write_payload(&mut send, Payload::RegisterDevice(request)).await?;
                send.shutdown().await?;
                Ok(recv)
            })
            .await?;

        tracing::debug!(generation = self.generation(), %user, "state stream opened");
        Ok(ServerStateStream::new(self.clone(), recv, slot))
    }

    /// Issue one unary call, bounded by `rpc_timeout`.
    ///
    /// # Errors
    ///
    /// - `Rpc { code, .. }` for an error trailer, or `DeadlineExceeded` when
    ///   the reply takes longer than `rpc_timeout`
    /// - `SessionClosed`, `Cancelled`, `Stream` as for the channels
    pub async fn rpc(
        &self,
        request: RpcRequest,
        cancel: &CancelToken,
    ) -> Result<RpcResponse, TransportError> {
        self.ensure_open()?;
        let limit = self.inner.config.rpc_timeout;

        let call = async {
            let (mut send, mut recv) = self.inner.connection.open_bi().await?;
            codec::write_payload(&mut send, Payload::Call(Call { method: Method::Rpc })).await?;
            codec::write_payload(&mut send, Payload::RpcRequest(request)).await?;
            send.shutdown().await?;
            read_rpc_reply(&mut recv).await
        };

        self.run(cancel, async {
            tokio::time::timeout(limit, call).await.map_err(|_| TransportError::Rpc {
                code: StatusCode::DeadlineExceeded,
                message: format!("no reply within {limit:?}"),
            })?
        })
        .await
    }

    /// Cancel every outstanding channel operation, wait for them to unwind,
    /// then release the connection.
    ///
    /// Idempotent and infallible. A concurrent second call waits for the
    /// first to finish. Each wait is bounded by `shutdown_timeout`.
    pub async fn close_and_wait(&self) {
        let mut closed = self.inner.closed.lock().await;
        if *closed {
            return;
        }

        self.inner.cancel.cancel();
        let limit = self.inner.config.shutdown_timeout;

        if tokio::time::timeout(limit, self.inner.gate.write()).await.is_err() {
            tracing::warn!(
                generation = self.generation(),
                "in-flight operations did not unwind within {limit:?}"
            );
        }

        self.inner.connection.close();
        if tokio::time::timeout(limit, self.inner.connection.closed()).await.is_err() {
            tracing::debug!(generation = self.generation(), "connection close not confirmed");
        }

        *closed = true;
        tracing::info!(endpoint = %self.inner.endpoint, generation = self.generation(), "session closed");
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.cancel.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }

    /// Run one channel operation under the gate, racing it against both the
    /// caller's token and session shutdown.
    pub(crate) async fn run<T, F>(&self, cancel: &CancelToken, op: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        self.ensure_open()?;
        let _in_flight = self.inner.gate.read().await;
        self.ensure_open()?;

        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(TransportError::SessionClosed),
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            result = op => result,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.inner.endpoint)
            .field("generation", &self.inner.generation)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportClient for Session {
    fn endpoint(&self) -> &ServerEndpoint {
        Session::endpoint(self)
    }

    async fn open_update_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<UpdateDeviceStream, TransportError> {
        Session::open_update_stream(self, cancel).await
    }

    async fn open_state_stream(
        &self,
        request: RegisterDeviceRequest,
        cancel: &CancelToken,
    ) -> Result<ServerStateStream, TransportError> {
        Session::open_state_stream(self, request, cancel).await
    }

    async fn rpc(
        &self,
        request: RpcRequest,
        cancel: &CancelToken,
    ) -> Result<RpcResponse, TransportError> {
        Session::rpc(self, request, cancel).await
    }

    async fn close_and_wait(&self) {
        Session::close_and_wait(self).await;
    }
}

async fn read_rpc_reply(recv: &mut RecvHalf) -> Result<RpcResponse, TransportError> {
    let response = match codec::read_payload(recv).await? {
        Some(Payload::RpcResponse(response)) => response,
        Some(Payload::Status(status)) => {
            return Err(TransportError::Rpc { code: status.code, message: status.message });
        },
        Some(other) => return Err(unexpected("RpcResponse", &other)),
        None => return Err(cut_off()),
    };

    match codec::read_payload(recv).await? {
        Some(Payload::Status(status)) if status.is_ok() => Ok(response),
        Some(Payload::Status(status)) => {
            Err(TransportError::Rpc { code: status.code, message: status.message })
        },
        Some(other) => Err(unexpected("Status", &other)),
        None => Err(cut_off()),
    }
}

pub(crate) fn unexpected(expected: &'static str, actual: &Payload) -> TransportError {
    leapbrush_proto::ProtocolError::UnexpectedFrame { expected, actual: actual.opcode() }.into()
}

pub(crate) fn cut_off() -> TransportError {
    TransportError::stream(StreamFailure::ConnectionLost, "stream ended without a status trailer")
}

/// Claim on a session's single channel slot of one kind, released on drop.
#[derive(Debug)]
pub(crate) struct OpenSlot {
    flag: Arc<AtomicBool>,
}

impl OpenSlot {
    fn claim(flag: &Arc<AtomicBool>, kind: StreamKind) -> Result<Self, TransportError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyOpen(kind));
        }
        Ok(Self { flag: Arc::clone(flag) })
    }
}

impl Drop for OpenSlot {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use leapbrush_proto::payloads::{
        call::Status,
        rpc::{QueryUsersRequest, QueryUsersResponse},
    };

    use super::*;
    use crate::{
        Scheme,
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

    fn register() -> RegisterDeviceRequest {
        RegisterDeviceRequest { user_name: "alice".into(), app_version: "1.0".into() }
    }

    #[tokio::test]
    async fn second_update_stream_is_rejected_until_first_is_dropped() {
        let (session, _peer) = connected().await;
        let cancel = CancelToken::new();

        let first = session.open_update_stream(&cancel).await.expect("first");
        let err = session.open_update_stream(&cancel).await.expect_err("second");
        assert_eq!(err, TransportError::AlreadyOpen(StreamKind::Update));

        drop(first);
        session.open_update_stream(&cancel).await.expect("slot released");
    }

    #[tokio::test]
    async fn state_and_update_slots_are_independent() {
        let (session, _peer) = connected().await;
        let cancel = CancelToken::new();

        let _update = session.open_update_stream(&cancel).await.expect("update");
        let _state = session.open_state_stream(register(), &cancel).await.expect("state");
        let err = session.open_state_stream(register(), &cancel).await.expect_err("second");
        assert_eq!(err, TransportError::AlreadyOpen(StreamKind::State));
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_session_closed() {
        let (session, _peer) = connected().await;
        let cancel = CancelToken::new();

        session.close_and_wait().await;

        let err = session.open_update_stream(&cancel).await.expect_err("closed");
        assert_eq!(err, TransportError::SessionClosed);
        let err = session.rpc(RpcRequest::default(), &cancel).await.expect_err("closed");
        assert_eq!(err, TransportError::SessionClosed);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn rpc_round_trip() {
        let (session, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            let (mut send, mut recv) = peer.accept_bi().await.expect("stream");
            let call = codec::read_payload(&mut recv).await.expect("read").expect("call");
            assert_eq!(call, Payload::Call(Call { method: Method::Rpc }));
            let request = codec::read_payload(&mut recv).await.expect("read").expect("request");
            assert!(matches!(request, Payload::RpcRequest(_)));

            let response = RpcResponse { query_users: Some(QueryUsersResponse::default()) };
            codec::write_payload(&mut send, Payload::RpcResponse(response)).await.expect("write");
            codec::write_payload(&mut send, Payload::Status(Status::ok())).await.expect("write");
            peer
        });

        let request =
            RpcRequest { user_name: "alice".into(), query_users: Some(QueryUsersRequest {}) };
        let response = session.rpc(request, &CancelToken::new()).await.expect("rpc");
        assert!(response.query_users.is_some());
        server.await.expect("join");
    }

    #[tokio::test]
    async fn rpc_error_trailer_is_surfaced() {
        let (session, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            let (mut send, _recv) = peer.accept_bi().await.expect("stream");
            let status = Status::error(StatusCode::NotFound, "no such user");
            codec::write_payload(&mut send, Payload::Status(status)).await.expect("write");
            peer
        });

        let err = session.rpc(RpcRequest::default(), &CancelToken::new()).await.expect_err("rpc");
        assert_eq!(
            err,
            TransportError::Rpc { code: StatusCode::NotFound, message: "no such user".into() }
        );
        let _peer = server.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn rpc_is_bounded_by_rpc_timeout() {
        let (session, mut peer) = connected().await;
        let server = tokio::spawn(async move {
            let stream = peer.accept_bi().await.expect("stream");
            (peer, stream)
        });

        let err = session.rpc(RpcRequest::default(), &CancelToken::new()).await.expect_err("rpc");
        assert!(matches!(err, TransportError::Rpc { code: StatusCode::DeadlineExceeded, .. }));
        let _held = server.await.expect("join");
    }

    #[tokio::test]
    async fn caller_cancel_aborts_pending_rpc() {
        let (session, mut peer) = connected().await;
        let _server = tokio::spawn(async move {
            let stream = peer.accept_bi().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop((peer, stream));
        });

        let cancel = CancelToken::new();
        let pending = tokio::spawn({
            let session = session.clone();
            let cancel = cancel.clone();
            async move { session.rpc(RpcRequest::default(), &cancel).await }
        });
        tokio::task::yield_now().await;
        cancel.cancel();

        let err = pending.await.expect("join").expect_err("cancelled");
        assert_eq!(err, TransportError::Cancelled);
    }
}
