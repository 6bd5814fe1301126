//! Test harness for the LeapBrush transport.
//!
//! Everything here runs in-process over the loopback transport, so tests are
//! fast and need no sockets or certificates.
//!
//! # Components
//!
//! - [`FakeServer`]: scripted server; tests decide frame by frame what the
//!   client sees, including error trailers and dropped connections
//! - [`FlakyConnector`]: wraps a connector and fails a chosen number of dials
//! - [`LoopbackServer`]: the real server logic served over loopback

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_server;
pub mod flaky;
pub mod loopback_server;

pub use fake_server::{FakePeer, FakeServer, FakeStream};
pub use flaky::FlakyConnector;
pub use loopback_server::LoopbackServer;

use leapbrush_client::{Scheme, ServerEndpoint};

/// Endpoint used for loopback sessions. Loopback connectors ignore it apart
/// from logging.
#[must_use]
pub fn loopback_endpoint() -> ServerEndpoint {
    ServerEndpoint::new(Scheme::Plaintext, "loopback", leapbrush_proto::DEFAULT_PORT)
}
