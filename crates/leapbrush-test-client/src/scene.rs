//! Synthetic device activity.
//!
//! [`Scene`] produces the stream of updates a headset would send: a
//! controller swaying along x, and optionally a spiral brush stroke that is
//! drawn and erased in turn. It never touches the clock; callers pass the
//! time since start.

use std::{collections::BTreeMap, time::Duration};

use leapbrush_proto::payloads::{
    device::UpdateDeviceRequest,
    types::{Anchor, BrushStroke, BrushStrokeRemove, Pose, SpaceInfo, UserState, Vector3},
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;

/// Time between drawing a stroke and erasing it, and between strokes.
pub const BRUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Poses in one generated stroke.
pub const STROKE_POSES: usize = 50;

/// Anchors reported when no anchor is named on the command line.
pub const FAKE_ANCHORS: [&str; 2] = ["FAKE_ANCHOR_0", "FAKE_ANCHOR_1"];

/// Invalid `--color` value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid hex color {input:?}: expected up to 8 hex digits (RRGGBBAA)")]
pub struct ColorError {
    /// Rejected input
    pub input: String,
}

/// Parse an `RRGGBBAA` hex color, with or without a leading `#`.
pub fn parse_color(input: &str) -> Result<u32, ColorError> {
    let digits = input.strip_prefix('#').unwrap_or(input);
    if digits.is_empty() || digits.len() > 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ColorError { input: input.to_string() });
    }
    u32::from_str_radix(digits, 16).map_err(|_| ColorError { input: input.to_string() })
}

/// What the simulated device does.
#[derive(Debug, Clone, Default)]
pub struct SceneConfig {
    /// User name and display name
    pub user_name: String,
    /// Ask the server to echo our own changes back
    pub echo: bool,
    /// Single anchor to report; two fake anchors otherwise
    pub found_anchor: Option<String>,
    /// Draw and erase strokes every [`BRUSH_INTERVAL`]
    pub create_brush_strokes: bool,
    /// Stroke color; zero leaves the server default
    pub color: u32,
}

/// Generator of device updates.
#[derive(Debug)]
pub struct Scene {
    config: SceneConfig,
    rng: StdRng,
    space_info: SpaceInfo,
    control: Vector3,
    space_info_sent: bool,
    /// Stroke id to anchor id
    created: BTreeMap<String, String>,
    last_brush_action: Option<Duration>,
}

impl Scene {
    /// Create a scene with an entropy-seeded generator.
    pub fn new(config: SceneConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Create a scene with a fixed generator.
    pub fn with_rng(config: SceneConfig, mut rng: StdRng) -> Self {
        let anchors = match &config.found_anchor {
            Some(id) => vec![id.clone()],
            None => FAKE_ANCHORS.iter().map(ToString::to_string).collect(),
        };
        let space_info = SpaceInfo {
            anchors: anchors
                .into_iter()
                .map(|id| Anchor { id, pose: Pose::IDENTITY })
                .collect(),
            ..SpaceInfo::default()
        };
        let control = Vector3 { x: 0.0, y: rng.gen_range(-0.25..0.25), z: rng.gen_range(1.0..2.0) };

        Self {
            config,
            rng,
            space_info,
            control,
            space_info_sent: false,
            created: BTreeMap::new(),
            last_brush_action: None,
        }
    }

    /// The user this scene speaks for.
    pub fn user_name(&self) -> &str {
        &self.config.user_name
    }

    /// Strokes drawn and not yet erased.
    pub fn live_strokes(&self) -> usize {
        self.created.len()
    }

    /// Start over on a new session: the next update carries the space info
    /// again.
    pub fn restart(&mut self) {
        self.space_info_sent = false;
    }

    /// Update to send `now` after start.
    pub fn next_update(&mut self, now: Duration) -> UpdateDeviceRequest {
        self.control.x = now.as_secs_f32().sin();

        let primary = self.space_info.anchors.first().map(|a| a.id.clone()).unwrap_or_default();
        let mut request = UpdateDeviceRequest {
            user_state: UserState {
                user_name: self.config.user_name.clone(),
                user_display_name: self.config.user_name.clone(),
                anchor_id: primary.clone(),
                control_pose: Some(Pose { position: self.control, ..Pose::IDENTITY }),
                ..UserState::default()
            },
            echo: self.config.echo,
            ..UpdateDeviceRequest::default()
        };

        if !self.space_info_sent {
            request.space_info = Some(self.space_info.clone());
            self.space_info_sent = true;
        }

        let due = self.last_brush_action.is_none_or(|last| now >= last + BRUSH_INTERVAL);
        if self.config.create_brush_strokes && due {
            if let Some((id, anchor_id)) = self.created.pop_first() {
                request.brush_stroke_remove = Some(BrushStrokeRemove { id, anchor_id });
            } else if !primary.is_empty() {
                let stroke = self.spiral(primary);
                self.created.insert(stroke.id.clone(), stroke.anchor_id.clone());
                request.brush_stroke_add = Some(stroke);
            }
            self.last_brush_action = Some(now);
        }

        request
    }

    fn spiral(&mut self, anchor_id: String) -> BrushStroke {
        let start = Vector3 {
            x: self.rng.gen_range(-0.25..0.25),
            y: self.rng.gen_range(-0.25..0.25),
            z: self.rng.gen_range(1.0..2.0),
        };
        let brush_poses = (0..STROKE_POSES)
            .map(|i| {
                let t = i as f32 * 0.1;
                Pose {
                    position: Vector3 {
                        x: start.x + (t * 5.0).cos() * 0.1,
                        y: start.y + (t * 5.0).sin() * 0.1,
                        z: start.z + t / 10.0,
                    },
                    ..Pose::IDENTITY
                }
            })
            .collect();

        BrushStroke {
            id: format!("B{}", self.rng.gen_range(0..i32::MAX)),
            anchor_id,
            user_name: self.config.user_name.clone(),
            start_index: 0,
            brush_poses,
            stroke_color_rgba: self.config.color,
            stroke_width: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn scene(create_brush_strokes: bool) -> Scene {
        let config = SceneConfig {
            user_name: "tester".into(),
            create_brush_strokes,
            color: 0x00ff_00ff,
            ..SceneConfig::default()
        };
        Scene::with_rng(config, StdRng::seed_from_u64(3))
    }

    #[test]
    fn space_info_only_on_first_update_of_a_session() {
        let mut scene = scene(false);
        let first = scene.next_update(Duration::ZERO);
        let anchors: Vec<_> =
            first.space_info.expect("space info").anchors.into_iter().map(|a| a.id).collect();
        assert_eq!(anchors, FAKE_ANCHORS);
        assert_eq!(first.user_state.anchor_id, FAKE_ANCHORS[0]);

        assert!(scene.next_update(Duration::from_millis(15)).space_info.is_none());

        scene.restart();
        assert!(scene.next_update(Duration::from_millis(30)).space_info.is_some());
    }

    #[test]
    fn found_anchor_replaces_fake_anchors() {
        let config = SceneConfig {
            user_name: "tester".into(),
            found_anchor: Some("table".into()),
            ..SceneConfig::default()
        };
        let mut scene = Scene::with_rng(config, StdRng::seed_from_u64(1));
        let update = scene.next_update(Duration::ZERO);

        assert_eq!(update.space_info.expect("space info").anchors.len(), 1);
        assert_eq!(update.user_state.anchor_id, "table");
    }

    #[test]
    fn strokes_are_drawn_then_erased() {
        let mut scene = scene(true);

        let drawn = scene.next_update(Duration::ZERO).brush_stroke_add.expect("stroke");
        assert!(drawn.id.starts_with('B'));
        assert_eq!(drawn.brush_poses.len(), STROKE_POSES);
        assert_eq!(drawn.stroke_color_rgba, 0x00ff_00ff);
        assert_eq!(scene.live_strokes(), 1);

        let quiet = scene.next_update(Duration::from_secs(1));
        assert!(quiet.brush_stroke_add.is_none() && quiet.brush_stroke_remove.is_none());

        let erased = scene.next_update(BRUSH_INTERVAL).brush_stroke_remove.expect("remove");
        assert_eq!(erased.id, drawn.id);
        assert_eq!(erased.anchor_id, drawn.anchor_id);
        assert_eq!(scene.live_strokes(), 0);

        assert!(scene.next_update(BRUSH_INTERVAL * 2).brush_stroke_add.is_some());
    }

    #[test]
    fn no_strokes_unless_enabled() {
        let mut scene = scene(false);
        for step in 0..10 {
            let update = scene.next_update(BRUSH_INTERVAL * step);
            assert!(update.brush_stroke_add.is_none());
        }
    }

    #[test]
    fn color_parsing() {
        assert_eq!(parse_color("ff0000ff"), Ok(0xff00_00ff));
        assert_eq!(parse_color("#00ff00ff"), Ok(0x00ff_00ff));
        assert_eq!(parse_color("ff"), Ok(0xff));
    }

    #[test]
    fn color_error_rendering() {
        let err = parse_color("not-a-color").expect_err("invalid");
        insta::assert_snapshot!(err.to_string(), @r#"invalid hex color "not-a-color": expected up to 8 hex digits (RRGGBBAA)"#);

        assert!(parse_color("").is_err());
        assert!(parse_color("123456789").is_err());
        assert!(parse_color("+ff").is_err());
    }

    proptest! {
        #[test]
        fn controller_stays_within_reach(millis in 0u64..10_000_000) {
            let mut scene = scene(false);
            let update = scene.next_update(Duration::from_millis(millis));
            let position = update.user_state.control_pose.expect("pose").position;
            prop_assert!((-1.0..=1.0).contains(&position.x));
            prop_assert!((-0.25..0.25).contains(&position.y));
            prop_assert!((1.0..2.0).contains(&position.z));
        }

        #[test]
        fn any_eight_digit_color_parses(color in any::<u32>()) {
            prop_assert_eq!(parse_color(&format!("{color:08x}")), Ok(color));
        }
    }
}
