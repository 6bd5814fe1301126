//! Server-originated snapshots.

use serde::{Deserialize, Serialize};

use super::types::{
    BrushStroke, BrushStrokeRemove, ExternalModel, ExternalModelRemove, UserState,
};

/// Server identification, sent once at the start of a listen stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Server version string
    pub server_version: String,
    /// Oldest client version the server supports
    pub min_app_version: String,
}

/// One merged snapshot of everything the listener has not seen yet.
///
/// A snapshot with every list empty and no `server_info` is a keepalive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStateResponse {
    /// Present only in the first snapshot of a stream
    pub server_info: Option<ServerInfo>,
    /// Participants whose state changed
    pub user_states: Vec<UserState>,
    /// Strokes created or extended (poses from `start_index` on)
    pub brush_stroke_adds: Vec<BrushStroke>,
    /// Strokes deleted
    pub brush_stroke_removes: Vec<BrushStrokeRemove>,
    /// Models created or moved
    pub external_model_adds: Vec<ExternalModel>,
    /// Models deleted
    pub external_model_removes: Vec<ExternalModelRemove>,
}

impl ServerStateResponse {
    /// True for a keepalive that carries no state.
    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        self.server_info.is_none()
            && self.user_states.is_empty()
            && self.brush_stroke_adds.is_empty()
            && self.brush_stroke_removes.is_empty()
            && self.external_model_adds.is_empty()
            && self.external_model_removes.is_empty()
    }
}
