//! WebSocket message DTOs.
//!
//! Every message is a JSON object tagged by `type`.

use serde::{Deserialize, Serialize};

/// Message received from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ChatMessage {
        #[serde(default)]
        content: String,
    },
    Ping,
    HealthCheck,
}

impl ClientMessage {
    /// `type` values understood by the server.
    pub const KNOWN_TYPES: [&'static str; 3] = ["chat_message", "ping", "health_check"];
}

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ChatHistory {
        messages: Vec<MessageView>,
    },
    ChatMessage {
        message: MessageView,
    },
    UserStatus {
        user_id: String,
        status: StatusDto,
        /// RFC 3339
        timestamp: String,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
    HealthCheckResponse {
        healthy: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusDto {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub content: String,
    pub sender: SenderView,
    /// RFC 3339
    pub created_at: String,
    pub is_read: bool,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderView {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}
