//! Per-stream request handling.
//!
//! [`serve_stream`] reads the opening `Call` frame and runs the matching
//! handler until the stream is finished with a `Status` trailer. It only needs
//! a pair of tokio byte streams, so QUIC and in-memory connections share it.

use std::sync::Arc;

use leapbrush_proto::{
    Payload, codec,
    payloads::{
        call::{Method, Status, StatusCode},
        device::UpdateDeviceResponse,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::watch,
};

use crate::{
    error::ServerError,
    hub::{Hub, Registration, shutting_down},
};

/// Serve one bidirectional stream to completion.
///
/// # Errors
///
/// - `ServerError::Transport` if the peer went away mid-stream
/// - `ServerError::Protocol` or `ServerError::World` if the client broke the
///   stream layout; an `InvalidArgument` trailer has been sent
pub async fn serve_stream<W, R>(hub: Arc<Hub>, mut send: W, mut recv: R) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let mut shutdown = hub.shutdown_signal();
    let method = match read_or_stop(&mut shutdown, &mut send, &mut recv).await {
        Ok(Incoming::Stopped | Incoming::Frame(None)) => return Ok(()),
        Ok(Incoming::Frame(Some(Payload::Call(call)))) => call.method,
        Ok(Incoming::Frame(Some(other))) => {
            let err = ServerError::Protocol(format!("expected Call, got {:?}", other.opcode()));
            return reject(&mut send, err).await;
        },
        Err(err) => return reject(&mut send, err).await,
    };

    tracing::debug!(%method, "stream opened");
    let result = match method {
        Method::UpdateDeviceStream => serve_updates(&hub, &mut send, &mut recv).await,
        Method::RegisterAndListen => serve_listener(&hub, &mut send, &mut recv).await,
        Method::Rpc => serve_rpc(&hub, &mut send, &mut recv).await,
    };

    match result {
        Err(err @ (ServerError::Protocol(_) | ServerError::World(_))) => reject(&mut send, err).await,
        other => other,
    }
}

async fn serve_updates<W, R>(hub: &Hub, send: &mut W, recv: &mut R) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let mut shutdown = hub.shutdown_signal();
    let mut applied = 0u64;

    loop {
        let Incoming::Frame(next) = read_or_stop(&mut shutdown, send, recv).await? else {
            return Ok(());
        };

        match next {
            Some(Payload::UpdateDevice(request)) => {
                hub.apply_update(request).await?;
                applied += 1;
            },
            Some(other) => {
                return Err(ServerError::Protocol(format!(
                    "expected UpdateDevice, got {:?}",
                    other.opcode()
                )));
            },
            None => break,
        }
    }

    tracing::debug!(applied, "update stream finished by client");
    codec::write_payload(send, Payload::UpdateDeviceAck(UpdateDeviceResponse {})).await?;
    finish(send, Status::ok()).await
}

async fn serve_listener<W, R>(hub: &Hub, send: &mut W, recv: &mut R) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let mut shutdown = hub.shutdown_signal();
    let Incoming::Frame(first) = read_or_stop(&mut shutdown, send, recv).await? else {
        return Ok(());
    };
    let request = match first {
        Some(Payload::RegisterDevice(request)) => request,
        Some(other) => {
            return Err(ServerError::Protocol(format!(
                "expected RegisterDevice, got {:?}",
                other.opcode()
            )));
        },
        None => return Err(ServerError::Protocol("stream finished before RegisterDevice".into())),
    };

    let registration = hub.register(&request).await?;
    let result = listen(hub, &registration, send).await;
    hub.unregister(&registration).await;

    if let Err(err) = &result {
        tracing::info!(user = %registration.user, error = %err, "listener disconnected");
    }
    result
}

async fn listen<W>(hub: &Hub, registration: &Registration, send: &mut W) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut shutdown = hub.shutdown_signal();
    let ping = hub.config().ping_interval;
    let mut first = true;

    loop {
        if !first {
            tokio::select! {
                biased;
                () = registration.signal.stopped() => {
                    tracing::info!(user = %registration.user, "listener replaced by a newer registration");
                    return finish(send, Status::ok()).await;
                },
                () = shutting_down(&mut shutdown) => {
                    return finish(send, unavailable()).await;
                },
                () = registration.signal.woken() => {},
                () = tokio::time::sleep(ping) => {},
            }
        }
        first = false;

        let Some(response) = hub.next_response(registration).await else {
            return finish(send, Status::ok()).await;
        };
        codec::write_payload(send, Payload::ServerState(response)).await?;
    }
}

async fn serve_rpc<W, R>(hub: &Hub, send: &mut W, recv: &mut R) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    let mut shutdown = hub.shutdown_signal();
    let Incoming::Frame(first) = read_or_stop(&mut shutdown, send, recv).await? else {
        return Ok(());
    };
    let request = match first {
        Some(Payload::RpcRequest(request)) => request,
        Some(other) => {
            return Err(ServerError::Protocol(format!(
                "expected RpcRequest, got {:?}",
                other.opcode()
            )));
        },
        None => return Err(ServerError::Protocol("stream finished before RpcRequest".into())),
    };

    if request.query_users.is_none() {
        return finish(send, Status::error(StatusCode::Unimplemented, "empty rpc request")).await;
    }

    let response = hub.rpc(&request).await;
    codec::write_payload(send, Payload::RpcResponse(response)).await?;
    finish(send, Status::ok()).await
}

/// Result of a read that lost or won the race against shutdown.
enum Incoming {
    Frame(Option<Payload>),
    /// Shutdown came first; the `Unavailable` trailer has been sent.
    Stopped,
}

/// Read the next frame unless the server starts shutting down first.
async fn read_or_stop<W, R>(
    shutdown: &mut watch::Receiver<bool>,
    send: &mut W,
    recv: &mut R,
) -> Result<Incoming, ServerError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    tokio::select! {
        biased;
        () = shutting_down(shutdown) => {
            finish(send, unavailable()).await?;
            Ok(Incoming::Stopped)
        },
        next = codec::read_payload(recv) => Ok(Incoming::Frame(next?)),
    }
}

fn unavailable() -> Status {
    Status::error(StatusCode::Unavailable, "server shutting down")
}

/// Write the trailer and finish our half.
async fn finish<W>(send: &mut W, status: Status) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
{
    codec::write_payload(send, Payload::Status(status)).await?;
    send.shutdown().await?;
    Ok(())
}

/// Finish with `InvalidArgument` and hand the original error back.
async fn reject<W>(send: &mut W, err: ServerError) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
{
    tracing::warn!(error = %err, "rejecting stream");
    if let Err(write_err) = finish(send, Status::error(StatusCode::InvalidArgument, err.to_string())).await {
        tracing::debug!(error = %write_err, "could not deliver rejection");
    }
    Err(err)
}
