//! Async shell around [`World`].
//!
//! The hub owns the world behind a mutex and turns the listener ids it reports
//! into wake-ups. Each listener task waits on its own [`ListenerSignal`], so a
//! burst of updates costs at most one pending wake per listener.

use std::{collections::HashMap, sync::Arc};

use leapbrush_proto::payloads::{
    device::{RegisterDeviceRequest, UpdateDeviceRequest},
    rpc::{RpcRequest, RpcResponse},
    state::ServerStateResponse,
};
use tokio::{
    sync::{Mutex, Notify, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::world::{ListenerId, World, WorldConfig, WorldError};

/// Wake-up and stop signals for one listener task.
#[derive(Debug, Default)]
pub struct ListenerSignal {
    wake: Notify,
    stop: Notify,
}

impl ListenerSignal {
    /// Resolves once new state is queued. A wake sent while nobody waits is
    /// kept for the next call.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Resolves once a newer registration replaced this listener.
    pub async fn stopped(&self) {
        self.stop.notified().await;
    }
}

/// Listener registration handed to the stream that owns it.
#[derive(Debug, Clone)]
pub struct Registration {
    /// User the listener belongs to
    pub user: String,
    /// Listener id inside the world
    pub id: ListenerId,
    /// Signals for this listener
    pub signal: Arc<ListenerSignal>,
}

#[derive(Debug)]
struct HubState {
    world: World<Instant>,
    signals: HashMap<ListenerId, Arc<ListenerSignal>>,
}

/// Shared server state used by every stream.
#[derive(Debug)]
pub struct Hub {
    config: WorldConfig,
    state: Mutex<HubState>,
    shutdown: watch::Sender<bool>,
}

impl Hub {
    /// Create a hub with an empty world.
    #[must_use]
    pub fn new(config: WorldConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: Mutex::new(HubState {
                world: World::new(config.clone()),
                signals: HashMap::new(),
            }),
            config,
            shutdown,
        }
    }

    /// World configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Apply one device update and wake affected listeners.
    ///
    /// # Errors
    ///
    /// `WorldError` if the update is rejected.
    pub async fn apply_update(&self, request: UpdateDeviceRequest) -> Result<(), WorldError> {
        let mut state = self.state.lock().await;
        let woken = state.world.apply_update(request, Instant::now())?;
        for id in woken {
            if let Some(signal) = state.signals.get(&id) {
                signal.wake.notify_one();
            }
        }
        Ok(())
    }

    /// Register a listener, stopping the one it replaces.
    ///
    /// # Errors
    ///
    /// `WorldError` if the registration names no user.
    pub async fn register(&self, request: &RegisterDeviceRequest) -> Result<Registration, WorldError> {
        let mut state = self.state.lock().await;
        let (id, replaced) =
            state.world.register_listener(&request.user_name, &request.app_version)?;

        if let Some(old) = replaced.and_then(|old| state.signals.remove(&old)) {
            old.stop.notify_one();
        }

        let signal = Arc::new(ListenerSignal::default());
        state.signals.insert(id, Arc::clone(&signal));
        Ok(Registration { user: request.user_name.clone(), id, signal })
    }

    /// Next snapshot for `registration`, or `None` once it was replaced.
    ///
    /// If more strokes are still queued the listener is woken again.
    pub async fn next_response(&self, registration: &Registration) -> Option<ServerStateResponse> {
        let mut state = self.state.lock().await;
        let (response, more) = state.world.next_response(&registration.user, registration.id)?;
        if more {
            registration.signal.wake.notify_one();
        }
        Some(response)
    }

    /// Forget `registration` if it is still current.
    pub async fn unregister(&self, registration: &Registration) {
        let mut state = self.state.lock().await;
        state.world.unregister_listener(&registration.user, registration.id);
        state.signals.remove(&registration.id);
    }

    /// Answer one unary call.
    pub async fn rpc(&self, request: &RpcRequest) -> RpcResponse {
        let state = self.state.lock().await;
        RpcResponse {
            query_users: request.query_users.as_ref().map(|_| state.world.query_users(&request.user_name)),
        }
    }

    /// Expire silent users now.
    pub async fn expire_users(&self) -> Vec<String> {
        self.state.lock().await.world.expire_users(Instant::now())
    }

    /// Ask every stream to finish. Listeners end with `Unavailable`.
    pub fn shutdown(&self) {
        tracing::info!("server shutting down");
        self.shutdown.send_replace(true);
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that flips to `true` on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Resolves once shutdown was requested.
    pub async fn shutdown_requested(&self) {
        shutting_down(&mut self.shutdown.subscribe()).await;
    }

    /// Run user expiry every `expiry_interval` until shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = hub.shutdown_signal();
            let mut interval = tokio::time::interval(hub.config.expiry_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutting_down(&mut shutdown) => break,
                    _ = interval.tick() => {
                        hub.expire_users().await;
                    },
                }
            }
        })
    }
}

/// Resolves once `shutdown` reads `true` or its sender is gone.
pub(crate) async fn shutting_down(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use leapbrush_proto::payloads::{
        rpc::QueryUsersRequest,
        types::{Anchor, SpaceInfo, UserState},
    };

    use super::*;

    fn update(user: &str) -> UpdateDeviceRequest {
        UpdateDeviceRequest {
            user_state: UserState { user_name: user.into(), ..Default::default() },
            space_info: Some(SpaceInfo {
                anchors: vec![Anchor { id: "a".into(), ..Anchor::default() }],
                ..SpaceInfo::default()
            }),
            ..Default::default()
        }
    }

    fn register(user: &str) -> RegisterDeviceRequest {
        RegisterDeviceRequest { user_name: user.into(), app_version: "1.0".into() }
    }

    #[tokio::test]
    async fn update_wakes_listeners_on_shared_anchor() {
        let hub = Hub::new(WorldConfig::default());
        hub.apply_update(update("bob")).await.expect("bob");
        let bob = hub.register(&register("bob")).await.expect("register");
        hub.next_response(&bob).await.expect("first");

        hub.apply_update(update("alice")).await.expect("alice");
        tokio::time::timeout(Duration::from_secs(1), bob.signal.woken())
            .await
            .expect("bob should be woken");

        let response = hub.next_response(&bob).await.expect("snapshot");
        assert_eq!(response.user_states.len(), 1);
    }

    #[tokio::test]
    async fn newer_registration_stops_the_old_listener() {
        let hub = Hub::new(WorldConfig::default());
        let first = hub.register(&register("alice")).await.expect("first");
        let second = hub.register(&register("alice")).await.expect("second");

        tokio::time::timeout(Duration::from_secs(1), first.signal.stopped())
            .await
            .expect("first should be stopped");
        assert!(hub.next_response(&first).await.is_none());
        assert!(hub.next_response(&second).await.is_some());

        hub.unregister(&first).await;
        assert!(hub.next_response(&second).await.is_some(), "stale unregister is a no-op");
    }

    #[tokio::test]
    async fn rpc_answers_query_users() {
        let hub = Hub::new(WorldConfig::default());
        hub.apply_update(update("alice")).await.expect("alice");

        let request = RpcRequest { user_name: "bob".into(), query_users: Some(QueryUsersRequest {}) };
        let response = hub.rpc(&request).await;
        let results = response.query_users.expect("query").results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].user_name, "alice");

        let empty = hub.rpc(&RpcRequest::default()).await;
        assert!(empty.query_users.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_expires_silent_users() {
        let hub = Arc::new(Hub::new(WorldConfig::default()));
        hub.apply_update(update("alice")).await.expect("alice");
        let maintenance = hub.spawn_maintenance();

        tokio::time::sleep(Duration::from_secs(12)).await;
        let response = hub.rpc(&RpcRequest { query_users: Some(QueryUsersRequest {}), ..Default::default() }).await;
        assert!(response.query_users.expect("query").results.is_empty());

        hub.shutdown();
        maintenance.await.expect("maintenance stops on shutdown");
    }
}
