//! HTTP API response DTOs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// `GET /api/stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub total_connections: usize,
    pub total_rooms: usize,
    pub total_users: usize,
    /// room id -> number of connections
    pub room_stats: BTreeMap<String, usize>,
    /// user id -> number of connections
    pub user_stats: BTreeMap<String, usize>,
}

/// `GET /api/rooms/{room_id}/presence`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPresenceResponse {
    pub room_id: String,
    pub online_user_ids: Vec<String>,
    pub user_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
