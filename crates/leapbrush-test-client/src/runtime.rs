//! Upload and download loops driven through a [`Lifecycle`].
//!
//! Each session gets two tasks: one writes a [`Scene`] update every
//! [`UPLOAD_INTERVAL`], the other listens for server state and logs stroke
//! changes. When either fails, both are stopped and the lifecycle decides
//! whether to reconnect. The scene moves into the upload task and back out,
//! so drawn strokes survive a reconnect.

use std::time::Duration;

use leapbrush_client::{
    CancelToken, Connector, Lifecycle, Session, TransportError,
    proto::payloads::{device::RegisterDeviceRequest, state::ServerStateResponse},
};
use thiserror::Error;
use tokio::{task::JoinError, time::Instant};

use crate::scene::Scene;

/// Time between device updates.
pub const UPLOAD_INTERVAL: Duration = Duration::from_millis(15);

/// Pause before listening again after the server ended the listen stream.
const RELISTEN_DELAY: Duration = Duration::from_millis(15);

/// Errors that end the client.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Connecting failed for good, or a failure did not warrant a reconnect.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A worker task panicked.
    #[error("worker task failed: {0}")]
    Task(#[from] JoinError),
}

/// Run until `cancel` fires, then close the session.
///
/// Returns `Ok` on cancellation.
pub async fn run<C>(
    mut lifecycle: Lifecycle<C>,
    mut scene: Scene,
    cancel: CancelToken,
) -> Result<(), RuntimeError>
where
    C: Connector,
{
    let started = Instant::now();
    let user = scene.user_name().to_string();

    let mut session = match lifecycle.connect(&cancel).await {
        Ok(session) => session,
        Err(TransportError::Cancelled) => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    loop {
        let workers = cancel.child();
        let mut uploader = tokio::spawn(upload(session.clone(), scene, started, workers.clone()));
        let mut listener = tokio::spawn(download(session.clone(), user.clone(), workers.clone()));

        let (returned, failure) = tokio::select! {
            joined = &mut uploader => {
                let (scene, err) = joined?;
                workers.cancel();
                listener.await?;
                (scene, err)
            },
            joined = &mut listener => {
                let err = joined?;
                workers.cancel();
                let (scene, _) = uploader.await?;
                (scene, err)
            },
        };
        scene = returned;

        if cancel.is_cancelled() {
            break;
        }
        match lifecycle.recover(&session, &failure, &cancel).await {
            Ok(next) => {
                tracing::info!(generation = next.generation(), "reconnected");
                scene.restart();
                session = next;
            },
            Err(TransportError::Cancelled) => break,
            Err(err) => {
                lifecycle.close().await;
                return Err(err.into());
            },
        }
    }

    tracing::info!("shutting down");
    lifecycle.close().await;
    Ok(())
}

/// Write updates until the channel fails. Hands the scene back with the
/// error.
async fn upload(
    session: Session,
    mut scene: Scene,
    started: Instant,
    cancel: CancelToken,
) -> (Scene, TransportError) {
    let err = upload_until_failure(&session, &mut scene, started, &cancel).await;
    match &err {
        TransportError::Cancelled | TransportError::SessionClosed => {
            tracing::debug!("upload stopped");
        },
        other => tracing::warn!(error = %other, "*** update stream failing"),
    }
    (scene, err)
}

async fn upload_until_failure(
    session: &Session,
    scene: &mut Scene,
    started: Instant,
    cancel: &CancelToken,
) -> TransportError {
    let mut stream = match session.open_update_stream(cancel).await {
        Ok(stream) => stream,
        Err(err) => return err,
    };
    let mut ticker = tokio::time::interval(UPLOAD_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return TransportError::Cancelled,
            _ = ticker.tick() => {},
        }

        let update = scene.next_update(started.elapsed());
        if let Err(err) = stream.write(update, cancel).await {
            return err;
        }
        if stream.sent() == 1 {
            tracing::info!("update stream started succeeding");
        }
    }
}

/// Listen until the session fails, registering again whenever the server
/// ends the stream cleanly.
async fn download(session: Session, user: String, cancel: CancelToken) -> TransportError {
    loop {
        let request = RegisterDeviceRequest {
            user_name: user.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let mut stream = match session.open_state_stream(request, &cancel).await {
            Ok(stream) => stream,
            Err(err) => return err,
        };

        let err = loop {
            match stream.read_next(&cancel).await {
                Ok(snapshot) => {
                    if stream.received() == 1 {
                        tracing::info!(server = ?stream.server_info(), "state stream started succeeding");
                    }
                    log_strokes(&snapshot);
                },
                Err(err) => break err,
            }
        };

        if err != TransportError::StreamEnded {
            if !matches!(err, TransportError::Cancelled | TransportError::SessionClosed) {
                tracing::warn!(error = %err, "*** state stream failing");
            }
            return err;
        }

        tracing::info!("server ended the state stream, registering again");
        tokio::select! {
            () = cancel.cancelled() => return TransportError::Cancelled,
            () = tokio::time::sleep(RELISTEN_DELAY) => {},
        }
    }
}

fn log_strokes(snapshot: &ServerStateResponse) {
    for stroke in &snapshot.brush_stroke_adds {
        tracing::info!(
            stroke = %stroke.id,
            anchor = %stroke.anchor_id,
            user = %stroke.user_name,
            start_index = stroke.start_index,
            poses = stroke.brush_poses.len(),
            "adding brush stroke"
        );
    }
    for remove in &snapshot.brush_stroke_removes {
        tracing::info!(stroke = %remove.id, anchor = %remove.anchor_id, "removing brush stroke");
    }
}
