//! Client-originated messages: device updates and listener registration.

use serde::{Deserialize, Serialize};

use super::types::{
    BrushStroke, BrushStrokeRemove, ExternalModel, ExternalModelRemove, SpaceInfo, UserState,
};

/// One locally produced delta, sent on an update stream.
///
/// `user_state` is always present and doubles as a liveness ping. The other
/// fields are set only when the corresponding thing changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateDeviceRequest {
    /// Sender's live state
    pub user_state: UserState,
    /// Sender's space, sent when anchors are (re)localized
    pub space_info: Option<SpaceInfo>,
    /// Stroke created or extended
    pub brush_stroke_add: Option<BrushStroke>,
    /// Stroke deleted
    pub brush_stroke_remove: Option<BrushStrokeRemove>,
    /// Model created or moved
    pub external_model_add: Option<ExternalModel>,
    /// Model deleted
    pub external_model_remove: Option<ExternalModelRemove>,
    /// Whether the sender also receives its own changes back
    pub echo: bool,
}

/// Terminal acknowledgement of an update stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDeviceResponse {}

/// Opens a listen stream for `user_name`.
///
/// Registering a name that already has a listen stream replaces that stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterDeviceRequest {
    /// Listener identity
    pub user_name: String,
    /// Client application version
    pub app_version: String,
}
