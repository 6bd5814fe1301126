//! Unary request/response messages.

use serde::{Deserialize, Serialize};

use super::types::{DeviceType, SpaceInfo};

/// Asks for the participants the server currently knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryUsersRequest {}

/// One participant in a [`QueryUsersResponse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryUsersResult {
    /// User identifier
    pub user_name: String,
    /// Display name
    pub user_display_name: String,
    /// Device in use
    pub device_type: DeviceType,
    /// Last reported space, if any
    pub space_info: Option<SpaceInfo>,
}

/// Participants known to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryUsersResponse {
    /// One entry per participant, ordered by user name
    pub results: Vec<QueryUsersResult>,
}

/// Unary request envelope. Each optional field selects one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcRequest {
    /// Caller identity
    pub user_name: String,
    /// List participants
    pub query_users: Option<QueryUsersRequest>,
}

/// Unary response envelope, mirroring the fields set in the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcResponse {
    /// Participant list
    pub query_users: Option<QueryUsersResponse>,
}
