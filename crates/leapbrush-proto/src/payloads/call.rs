//! Stream control messages: the opening `Call` and the closing `Status`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// RPC method selected by the first frame of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Client-streaming device updates
    UpdateDeviceStream,
    /// Server-streaming world state
    RegisterAndListen,
    /// Unary request/response
    Rpc,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UpdateDeviceStream => "UpdateDeviceStream",
            Self::RegisterAndListen => "RegisterAndListen",
            Self::Rpc => "Rpc",
        };
        f.write_str(name)
    }
}

/// Opens a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    /// Method to dispatch
    pub method: Method,
}

/// Outcome code of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Call completed normally
    Ok,
    /// Call was cancelled
    Cancelled,
    /// Request was malformed or out of order
    InvalidArgument,
    /// Call did not finish in time
    DeadlineExceeded,
    /// Referenced entity does not exist
    NotFound,
    /// Call was aborted by the server
    Aborted,
    /// Server is shutting down or overloaded
    Unavailable,
    /// Server-side bug
    Internal,
    /// Method not implemented
    Unimplemented,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Closes a stream. Exactly one per server half.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Outcome
    pub code: StatusCode,
    /// Human-readable detail, empty on success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    /// Successful completion.
    #[must_use]
    pub fn ok() -> Self {
        Self { code: StatusCode::Ok, message: String::new() }
    }

    /// Failed completion with a reason.
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// True for [`StatusCode::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}
