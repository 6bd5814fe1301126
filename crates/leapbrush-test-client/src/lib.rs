//! Load and smoke test client for LeapBrush servers.
//!
//! Pretends to be a headset: it uploads a moving controller pose every
//! 15 ms, optionally draws and erases brush strokes, and logs every stroke
//! the server reports. Running several instances against one server
//! exercises fan-out, supersession and reconnects.
//!
//! - [`scene`]: pure generator of device updates
//! - [`runtime`]: upload and download tasks over a reconnecting session

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod runtime;
pub mod scene;

pub use runtime::{RuntimeError, UPLOAD_INTERVAL, run};
pub use scene::{ColorError, Scene, SceneConfig, parse_color};
