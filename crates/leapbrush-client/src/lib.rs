//! LeapBrush session synchronization transport.
//!
//! A headset pushes its own device and drawing deltas to the collaboration
//! server and, at the same time, receives a merged stream of every
//! participant's state. This crate is the client side of that exchange.
//!
//! # Architecture
//!
//! ```text
//!  Lifecycle ──(connect / recover)──> Session ──> dyn Connection ──> QUIC | loopback
//!                                       │
//!                      ┌────────────────┼────────────────┐
//!              UpdateDeviceStream  ServerStateStream    rpc()
//!                (write, close)      (read_next)
//! ```
//!
//! [`Session`] owns one connection and hands out at most one channel of each
//! kind. Channels are independent streams on that connection and may be
//! driven from different tasks. A stream reset or an error trailer fails only
//! the channel it hits; losing the connection fails both.
//!
//! Every blocking operation takes an explicit [`CancelToken`]. Nothing retries
//! on its own: [`Lifecycle`] is the only layer that reconnects, and it does so
//! with capped, jittered exponential backoff.
//!
//! # Components
//!
//! - [`ServerEndpoint`]: `[ssl://]host[:port]` parsing
//! - [`Session`] / [`TransportClient`]: connection owner and caller contract
//! - [`UpdateDeviceStream`]: outbound ordered updates
//! - [`ServerStateStream`]: inbound snapshots
//! - [`Lifecycle`] / [`LifecycleMachine`]: reconnect policy
//! - [`QuicConnector`], [`loopback`]: transport implementations

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod cancel;
mod config;
mod connection;
mod endpoint;
mod error;
mod lifecycle;
mod listen;
pub mod loopback;
mod quic;
mod session;
mod update;

pub use cancel::CancelToken;
pub use config::{RetryPolicy, TransportConfig};
pub use connection::{Connection, Connector, RecvHalf, SendHalf};
pub use endpoint::{Scheme, ServerEndpoint};
pub use error::{ConnectionFailure, ErrorKind, StreamFailure, StreamKind, TransportError};
pub use leapbrush_proto as proto;
pub use lifecycle::{Backoff, Lifecycle, LifecycleAction, LifecycleMachine, LifecycleState};
pub use listen::ServerStateStream;
pub use quic::QuicConnector;
pub use session::{Session, TransportClient};
pub use update::UpdateDeviceStream;
