//! Shared world state and fan-out bookkeeping.
//!
//! Pure state machine in the action style: time is passed in, the caller is
//! told which listeners have new work, and nothing here performs I/O. The
//! async shell in [`crate::hub`] owns one `World` behind a mutex.
//!
//! # Model
//!
//! Users are keyed by name. Anchors are keyed by id and hold the set of users
//! that currently see them, plus every brush stroke and external model placed
//! on them. A user only hears about changes on anchors it shares with the
//! sender.
//!
//! Each listener (one per user, the newest registration wins) carries pending
//! notification sets. [`World::next_response`] drains them into one snapshot.
//! Brush strokes are streamed: a snapshot carries at most one stroke, and only
//! the poses this listener has not received yet.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Sub,
    time::{Duration, Instant},
};

use leapbrush_proto::payloads::{
    device::UpdateDeviceRequest,
    rpc::{QueryUsersResponse, QueryUsersResult},
    state::{ServerInfo, ServerStateResponse},
    types::{BrushStroke, BrushStrokeRemove, ExternalModel, ExternalModelRemove, SpaceInfo, UserState},
};
use thiserror::Error;

/// Version reported to clients in [`ServerInfo`].
pub const SERVER_VERSION: &str = "0.3";

/// Oldest client version this server accepts, reported in [`ServerInfo`].
pub const MIN_APP_VERSION: &str = "0.0";

/// Timing and verbosity of the world and its listeners.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Users that send nothing for this long are expired
    pub user_timeout: Duration,
    /// Listeners with nothing to send still send an empty snapshot this often
    pub ping_interval: Duration,
    /// How often expiry runs
    pub expiry_interval: Duration,
    /// Log every stroke and model change
    pub verbose: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            user_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            expiry_interval: Duration::from_secs(1),
            verbose: false,
        }
    }
}

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Rejected client input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// An update or registration named no user
    #[error("request has an empty user name")]
    MissingUserName,
}

#[derive(Debug)]
struct UserEntry<I> {
    last_seen: I,
    state: UserState,
    space_info: Option<SpaceInfo>,
}

#[derive(Debug, Default)]
struct AnchorEntry {
    users: BTreeSet<String>,
    strokes: BTreeMap<String, BrushStroke>,
    models: BTreeMap<String, ExternalModel>,
}

/// Poses of one stroke already delivered to one listener.
#[derive(Debug)]
struct StrokeProgress {
    anchor_id: String,
    poses_sent: usize,
}

#[derive(Debug)]
struct Listener {
    id: ListenerId,
    app_version: String,
    sent_server_info: bool,
    progress: BTreeMap<String, StrokeProgress>,
    /// User names whose state changed
    user_changes: BTreeSet<String>,
    /// Stroke id to anchor id, for each pending map below
    stroke_adds: BTreeMap<String, String>,
    stroke_removes: BTreeMap<String, String>,
    model_adds: BTreeMap<String, String>,
    model_removes: BTreeMap<String, String>,
}

impl Listener {
    fn new(id: ListenerId, app_version: String) -> Self {
        Self {
            id,
            app_version,
            sent_server_info: false,
            progress: BTreeMap::new(),
            user_changes: BTreeSet::new(),
            stroke_adds: BTreeMap::new(),
            stroke_removes: BTreeMap::new(),
            model_adds: BTreeMap::new(),
            model_removes: BTreeMap::new(),
        }
    }
}

/// What changed on an anchor, for fan-out to the users that see it.
#[derive(Clone, Copy)]
enum AnchorChange<'a> {
    StrokeAdd { id: &'a str, start_index: usize },
    StrokeRemove { id: &'a str },
    ModelAdd { id: &'a str },
    ModelRemove { id: &'a str },
}

/// Authoritative session state.
#[derive(Debug)]
pub struct World<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    config: WorldConfig,
    users: BTreeMap<String, UserEntry<I>>,
    anchors: BTreeMap<String, AnchorEntry>,
    /// Keyed by user name
    listeners: BTreeMap<String, Listener>,
    next_listener: u64,
}

impl<I> World<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create an empty world.
    #[must_use]
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            users: BTreeMap::new(),
            anchors: BTreeMap::new(),
            listeners: BTreeMap::new(),
            next_listener: 0,
        }
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Number of users that sent an update within the timeout.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Apply one device update from `request.user_state.user_name`.
    ///
    /// Returns the listeners that now have pending work. Stroke and model
    /// changes on anchors this server has never seen are ignored.
    ///
    /// # Errors
    ///
    /// `WorldError::MissingUserName` if the update names no user.
    pub fn apply_update(
        &mut self,
        request: UpdateDeviceRequest,
        now: I,
    ) -> Result<Vec<ListenerId>, WorldError> {
        let UpdateDeviceRequest {
            user_state,
            space_info,
            brush_stroke_add,
            brush_stroke_remove,
            external_model_add,
            external_model_remove,
            echo,
        } = request;

        let user = user_state.user_name.clone();
        if user.is_empty() {
            return Err(WorldError::MissingUserName);
        }

        let mut woken = BTreeSet::new();

        let entry = self.users.entry(user.clone()).or_insert_with(|| {
            tracing::info!(%user, display_name = %user_state.user_display_name, "first state update received");
            UserEntry { last_seen: now, state: UserState::default(), space_info: None }
        });
        entry.last_seen = now;
        if !entry.state.user_display_name.is_empty()
            && entry.state.user_display_name != user_state.user_display_name
        {
            tracing::info!(
                %user,
                from = %entry.state.user_display_name,
                to = %user_state.user_display_name,
                "display name changed"
            );
        }
        entry.state = user_state;

        if let Some(space_info) = space_info {
            let changed =
                entry.space_info.as_ref().is_none_or(|old| !old.same_anchor_ids(&space_info));
            if changed {
                tracing::info!(
                    %user,
                    space = %space_info.space_name,
                    anchors = ?space_info.anchors.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(),
                    "found anchors changed"
                );
                let old = entry.space_info.replace(space_info);
                leave_anchors(&mut self.anchors, &user, old.as_ref());
                self.join_anchors(&user);
                self.queue_anchor_contents(&user);
            } else {
                if self.config.verbose {
                    tracing::debug!(%user, "found anchors updated, ids unchanged");
                }
                entry.space_info = Some(space_info);
            }
        }

        self.distribute_user_change(&user, echo, &mut woken);

        if let Some(stroke) = brush_stroke_add {
            self.add_stroke(&user, stroke, echo, &mut woken);
        }

        if let Some(BrushStrokeRemove { id, anchor_id }) = brush_stroke_remove {
            if let Some(anchor) = self.anchors.get_mut(&anchor_id) {
                anchor.strokes.remove(&id);
                fan_out(
                    &mut self.listeners,
                    anchor,
                    &anchor_id,
                    AnchorChange::StrokeRemove { id: &id },
                    &user,
                    echo,
                    &mut woken,
                );
                if self.config.verbose {
                    tracing::debug!(%user, stroke = %id, anchor = %anchor_id, "brush stroke removed");
                }
            }
        }

        if let Some(model) = external_model_add {
            let (id, anchor_id) = (model.id.clone(), model.anchor_id.clone());
            if let Some(anchor) = self.anchors.get_mut(&anchor_id) {
                if self.config.verbose {
                    tracing::debug!(%user, model = %id, file = %model.file_name, "model placed");
                }
                anchor.models.insert(id.clone(), model);
                fan_out(
                    &mut self.listeners,
                    anchor,
                    &anchor_id,
                    AnchorChange::ModelAdd { id: &id },
                    &user,
                    echo,
                    &mut woken,
                );
            }
        }

        if let Some(ExternalModelRemove { id, anchor_id }) = external_model_remove {
            if let Some(anchor) = self.anchors.get_mut(&anchor_id) {
                anchor.models.remove(&id);
                fan_out(
                    &mut self.listeners,
                    anchor,
                    &anchor_id,
                    AnchorChange::ModelRemove { id: &id },
                    &user,
                    echo,
                    &mut woken,
                );
                if self.config.verbose {
                    tracing::debug!(%user, model = %id, anchor = %anchor_id, "model removed");
                }
            }
        }

        Ok(woken.into_iter().collect())
    }

    /// Install the listener for `user`, replacing any earlier one.
    ///
    /// Returns the new id and the id of the replaced listener, which the
    /// caller must end. Everything already on the user's anchors is queued.
    ///
    /// # Errors
    ///
    /// `WorldError::MissingUserName` for an empty user name.
    pub fn register_listener(
        &mut self,
        user: &str,
        app_version: &str,
    ) -> Result<(ListenerId, Option<ListenerId>), WorldError> {
        if user.is_empty() {
            return Err(WorldError::MissingUserName);
        }

        let id = ListenerId(self.next_listener);
        self.next_listener += 1;

        let replaced = self
            .listeners
            .insert(user.to_string(), Listener::new(id, app_version.to_string()))
            .map(|old| old.id);

        tracing::info!(
            %user,
            %app_version,
            listener = %id,
            replaced = ?replaced,
            listeners = self.listeners.len(),
            "listener registered"
        );

        self.queue_anchor_contents(user);
        Ok((id, replaced))
    }

    /// Remove listener `id` if it is still the current one for `user`.
    ///
    /// Returns whether anything was removed.
    pub fn unregister_listener(&mut self, user: &str, id: ListenerId) -> bool {
        if self.listeners.get(user).is_none_or(|listener| listener.id != id) {
            return false;
        }
        self.listeners.remove(user);
        tracing::info!(%user, listener = %id, listeners = self.listeners.len(), "listener removed");
        true
    }

    /// Drain pending work for listener `id` into one snapshot.
    ///
    /// Returns `None` if the listener was replaced or removed. The flag is
    /// true when further brush strokes are still queued, in which case the
    /// caller should ask again without waiting.
    pub fn next_response(&mut self, user: &str, id: ListenerId) -> Option<(ServerStateResponse, bool)> {
        let listener = self.listeners.get_mut(user).filter(|l| l.id == id)?;
        let mut response = ServerStateResponse::default();

        if !listener.sent_server_info {
            response.server_info = Some(ServerInfo {
                server_version: SERVER_VERSION.to_string(),
                min_app_version: MIN_APP_VERSION.to_string(),
            });
            listener.sent_server_info = true;
        }

        for name in std::mem::take(&mut listener.user_changes) {
            if let Some(entry) = self.users.get(&name) {
                response.user_states.push(entry.state.clone());
            }
        }

        while let Some((stroke_id, anchor_id)) = listener.stroke_adds.pop_first() {
            let Some(stroke) = self.anchors.get(&anchor_id).and_then(|a| a.strokes.get(&stroke_id))
            else {
                continue;
            };

            let progress = listener
                .progress
                .entry(stroke_id)
                .or_insert_with(|| StrokeProgress { anchor_id: anchor_id.clone(), poses_sent: 0 });
            let total = stroke.brush_poses.len();
            if progress.poses_sent >= total {
                continue;
            }

            let delta = if progress.poses_sent == 0 {
                stroke.clone()
            } else {
                BrushStroke {
                    id: stroke.id.clone(),
                    anchor_id: stroke.anchor_id.clone(),
                    start_index: u32::try_from(progress.poses_sent).unwrap_or(u32::MAX),
                    brush_poses: stroke.brush_poses[progress.poses_sent..].to_vec(),
                    ..BrushStroke::default()
                }
            };
            if self.config.verbose {
                tracing::debug!(
                    %user,
                    stroke = %stroke.id,
                    author = %stroke.user_name,
                    new_poses = delta.brush_poses.len(),
                    total,
                    "sending brush stroke"
                );
            }
            progress.poses_sent = total;
            response.brush_stroke_adds.push(delta);
            break;
        }
        let more = !listener.stroke_adds.is_empty();

        for (id, anchor_id) in std::mem::take(&mut listener.stroke_removes) {
            response.brush_stroke_removes.push(BrushStrokeRemove { id, anchor_id });
        }

        for (id, anchor_id) in std::mem::take(&mut listener.model_adds) {
            if let Some(model) = self.anchors.get(&anchor_id).and_then(|a| a.models.get(&id)) {
                response.external_model_adds.push(model.clone());
            }
        }

        for (id, anchor_id) in std::mem::take(&mut listener.model_removes) {
            response.external_model_removes.push(ExternalModelRemove { id, anchor_id });
        }

        Some((response, more))
    }

    /// List every known user for `requester`.
    #[must_use]
    pub fn query_users(&self, requester: &str) -> QueryUsersResponse {
        let results: Vec<_> = self
            .users
            .iter()
            .map(|(name, entry)| QueryUsersResult {
                user_name: name.clone(),
                user_display_name: entry.state.user_display_name.clone(),
                device_type: entry.state.device_type,
                space_info: entry.space_info.clone(),
            })
            .collect();

        if self.config.verbose {
            tracing::debug!(user = %requester, results = results.len(), "queried users");
        }
        QueryUsersResponse { results }
    }

    /// Drop users silent for longer than `user_timeout`.
    ///
    /// Returns the expired user names. Their listeners are unaffected.
    pub fn expire_users(&mut self, now: I) -> Vec<String> {
        let timeout = self.config.user_timeout;
        let expired: Vec<String> = self
            .users
            .iter()
            .filter(|(_, entry)| now - entry.last_seen > timeout)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            if let Some(entry) = self.users.remove(name) {
                leave_anchors(&mut self.anchors, name, entry.space_info.as_ref());
            }
            tracing::info!(user = %name, "expiring user after timeout");
        }
        expired
    }

    /// App version the current listener of `user` registered with.
    #[must_use]
    pub fn listener_app_version(&self, user: &str) -> Option<&str> {
        self.listeners.get(user).map(|l| l.app_version.as_str())
    }

    fn join_anchors(&mut self, user: &str) {
        let Some(space_info) = self.users.get(user).and_then(|e| e.space_info.as_ref()) else {
            return;
        };
        for anchor in &space_info.anchors {
            self.anchors.entry(anchor.id.clone()).or_default().users.insert(user.to_string());
        }
    }

    /// Queue everything on the user's anchors for its listener and forget
    /// progress on strokes of anchors it no longer sees.
    fn queue_anchor_contents(&mut self, user: &str) {
        let Some(space_info) = self.users.get(user).and_then(|e| e.space_info.as_ref()) else {
            return;
        };
        let Some(listener) = self.listeners.get_mut(user) else {
            return;
        };

        let mut visible = BTreeSet::new();
        for anchor_ref in &space_info.anchors {
            visible.insert(anchor_ref.id.as_str());
            if let Some(anchor) = self.anchors.get(&anchor_ref.id) {
                for stroke_id in anchor.strokes.keys() {
                    listener.stroke_adds.insert(stroke_id.clone(), anchor_ref.id.clone());
                }
                for model_id in anchor.models.keys() {
                    listener.model_adds.insert(model_id.clone(), anchor_ref.id.clone());
                }
            }
        }

        listener.progress.retain(|_, progress| visible.contains(progress.anchor_id.as_str()));
    }

    fn distribute_user_change(&mut self, user: &str, echo: bool, woken: &mut BTreeSet<ListenerId>) {
        let Some(space_info) = self.users.get(user).and_then(|e| e.space_info.as_ref()) else {
            return;
        };

        let audience: BTreeSet<&String> = space_info
            .anchors
            .iter()
            .filter_map(|anchor| self.anchors.get(&anchor.id))
            .flat_map(|anchor| anchor.users.iter())
            .collect();

        for target in audience {
            if target == user && !echo {
                continue;
            }
            if let Some(listener) = self.listeners.get_mut(target) {
                listener.user_changes.insert(user.to_string());
                woken.insert(listener.id);
            }
        }
    }

    fn add_stroke(
        &mut self,
        user: &str,
        mut stroke: BrushStroke,
        echo: bool,
        woken: &mut BTreeSet<ListenerId>,
    ) {
        let anchor_id = stroke.anchor_id.clone();
        let Some(anchor) = self.anchors.get_mut(&anchor_id) else {
            tracing::debug!(%user, anchor = %anchor_id, "stroke on unknown anchor ignored");
            return;
        };

        let id = stroke.id.clone();
        let new_poses = stroke.brush_poses.len();
        match anchor.strokes.get_mut(&id) {
            Some(existing) => {
                let start = stroke.start_index as usize;
                if start < existing.brush_poses.len() {
                    existing.brush_poses.truncate(start);
                }
                existing.brush_poses.append(&mut stroke.brush_poses);
            },
            None => {
                if stroke.start_index != 0 {
                    tracing::warn!(
                        %user,
                        stroke = %id,
                        start_index = stroke.start_index,
                        "new brush stroke has a nonzero start index, data loss likely"
                    );
                    stroke.start_index = 0;
                }
                anchor.strokes.insert(id.clone(), stroke.clone());
            },
        }

        let start_index = stroke.start_index as usize;
        if self.config.verbose {
            tracing::debug!(%user, stroke = %id, anchor = %anchor_id, start_index, new_poses, "brush stroke updated");
        }

        fan_out(
            &mut self.listeners,
            anchor,
            &anchor_id,
            AnchorChange::StrokeAdd { id: &id, start_index },
            user,
            echo,
            woken,
        );
    }
}

/// Queue `change` for every listener of a user on `anchor`.
///
/// The sender is skipped unless it asked for an echo.
fn fan_out(
    listeners: &mut BTreeMap<String, Listener>,
    anchor: &AnchorEntry,
    anchor_id: &str,
    change: AnchorChange<'_>,
    sender: &str,
    echo: bool,
    woken: &mut BTreeSet<ListenerId>,
) {
    for target in &anchor.users {
        if target == sender && !echo {
            continue;
        }
        let Some(listener) = listeners.get_mut(target) else {
            continue;
        };

        match change {
            AnchorChange::StrokeAdd { id, start_index } => {
                if let Some(progress) = listener.progress.get_mut(id) {
                    progress.poses_sent = progress.poses_sent.min(start_index);
                }
                listener.stroke_adds.insert(id.to_string(), anchor_id.to_string());
            },
            AnchorChange::StrokeRemove { id } => {
                listener.stroke_removes.insert(id.to_string(), anchor_id.to_string());
            },
            AnchorChange::ModelAdd { id } => {
                listener.model_adds.insert(id.to_string(), anchor_id.to_string());
            },
            AnchorChange::ModelRemove { id } => {
                listener.model_removes.insert(id.to_string(), anchor_id.to_string());
            },
        }
        woken.insert(listener.id);
    }
}

fn leave_anchors(anchors: &mut BTreeMap<String, AnchorEntry>, user: &str, space: Option<&SpaceInfo>) {
    let Some(space) = space else {
        return;
    };
    for anchor in &space.anchors {
        if let Some(entry) = anchors.get_mut(&anchor.id) {
            entry.users.remove(user);
        }
    }
}
