//! Shared state types carried inside device updates and snapshots.
//!
//! All poses are expressed relative to the anchor named alongside them.
//! Missing fields decode to their defaults so older peers can talk to newer
//! ones.

use serde::{Deserialize, Serialize};

/// 3D vector in meters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
    /// W component
    pub w: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    /// No rotation.
    pub const IDENTITY: Self = Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };
}

/// Position and rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pose {
    /// Translation
    pub position: Vector3,
    /// Orientation
    pub rotation: Quaternion,
}

impl Pose {
    /// Pose at the anchor origin.
    pub const IDENTITY: Self =
        Self { position: Vector3 { x: 0.0, y: 0.0, z: 0.0 }, rotation: Quaternion::IDENTITY };
}

/// Kind of device a participant is using.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Not reported
    #[default]
    Unknown,
    /// Headset
    MagicLeap,
    /// Desktop viewer without a headset
    DesktopSpectator,
}

/// Tool currently held by a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolState {
    /// Not reported
    #[default]
    Unknown,
    /// Pointer laser
    Laser,
    /// Free-hand scribble brush
    BrushScribble,
    /// Polygon brush
    BrushPoly,
    /// Stroke eraser
    Eraser,
    /// Menu open
    Menu,
}

/// Charging state of a headset battery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargeState {
    /// Not reported
    #[default]
    Unknown,
    /// Running on battery
    Discharging,
    /// Connected to power
    Charging,
    /// Fully charged
    Full,
}

/// Headset battery report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryStatus {
    /// Charge level in percent
    pub level: u8,
    /// Charging state
    pub state: ChargeState,
}

/// Live state of one participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserState {
    /// Stable user identifier
    pub user_name: String,
    /// Name shown to other participants
    pub user_display_name: String,
    /// Device in use
    pub device_type: DeviceType,
    /// Anchor the poses below are relative to
    pub anchor_id: String,
    /// Head pose, absent when no anchor is localized
    pub head_pose: Option<Pose>,
    /// Controller pose, absent when no anchor is localized
    pub control_pose: Option<Pose>,
    /// Tool in hand
    pub tool_state: ToolState,
    /// Tool color as packed RGBA
    pub tool_color_rgba: u32,
    /// Battery report, if the device has one
    pub headset_battery: Option<BatteryStatus>,
}

/// How the device localizes its anchors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingMode {
    /// Not reported
    #[default]
    Unknown,
    /// Maps stored on the device
    OnDevice,
    /// Maps shared through a cloud service
    ArCloud,
}

/// Spatial anchor found by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Anchor {
    /// Anchor identifier
    pub id: String,
    /// Anchor pose in the device's space
    pub pose: Pose,
}

/// Space a device is localized in, with the anchors it has found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceInfo {
    /// Space identifier
    pub space_id: String,
    /// Human-readable space name
    pub space_name: String,
    /// Localization mode
    pub mapping_mode: MappingMode,
    /// Anchors currently found, in device order
    pub anchors: Vec<Anchor>,
    /// Whether the anchors were imported rather than found locally
    pub using_imported_anchors: bool,
}

impl SpaceInfo {
    /// Compare only the anchor ids, in order.
    ///
    /// Pose refinements of the same anchors do not count as a change of
    /// membership.
    #[must_use]
    pub fn same_anchor_ids(&self, other: &Self) -> bool {
        self.anchors.len() == other.anchors.len()
            && self.anchors.iter().zip(&other.anchors).all(|(a, b)| a.id == b.id)
    }
}

/// Brush stroke, possibly partial.
///
/// A stroke is streamed incrementally: `start_index` is the index of the
/// first pose in `brush_poses` within the full stroke. A value of zero
/// carries the whole stroke.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrushStroke {
    /// Stroke identifier
    pub id: String,
    /// Anchor the stroke is attached to
    pub anchor_id: String,
    /// Author
    pub user_name: String,
    /// Index of `brush_poses[0]` within the full stroke
    pub start_index: u32,
    /// Poses from `start_index` on
    pub brush_poses: Vec<Pose>,
    /// Stroke color as packed RGBA, zero for the default color
    pub stroke_color_rgba: u32,
    /// Stroke width in meters, zero for the default width
    pub stroke_width: f32,
}

/// Removal of a brush stroke.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrushStrokeRemove {
    /// Stroke identifier
    pub id: String,
    /// Anchor the stroke was attached to
    pub anchor_id: String,
}

/// Externally authored 3D model placed in the scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalModel {
    /// Model instance identifier
    pub id: String,
    /// Anchor the model is attached to
    pub anchor_id: String,
    /// Source asset file name
    pub file_name: String,
    /// Placement relative to the anchor
    pub transform: Pose,
    /// Last user to move or add the model
    pub modified_by_user_name: String,
}

/// Removal of an external model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalModelRemove {
    /// Model instance identifier
    pub id: String,
    /// Anchor the model was attached to
    pub anchor_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(ids: &[&str]) -> SpaceInfo {
        SpaceInfo {
            anchors: ids
                .iter()
                .map(|id| Anchor { id: (*id).to_string(), pose: Pose::IDENTITY })
                .collect(),
            ..SpaceInfo::default()
        }
    }

    #[test]
    fn anchor_ids_compare_in_order() {
        assert!(space(&["a", "b"]).same_anchor_ids(&space(&["a", "b"])));
        assert!(!space(&["a", "b"]).same_anchor_ids(&space(&["b", "a"])));
        assert!(!space(&["a"]).same_anchor_ids(&space(&["a", "b"])));
        assert!(space(&[]).same_anchor_ids(&space(&[])));
    }

    #[test]
    fn anchor_pose_changes_are_not_membership_changes() {
        let mut moved = space(&["a"]);
        moved.anchors[0].pose.position.x = 3.0;

        assert!(space(&["a"]).same_anchor_ids(&moved));
    }
}
