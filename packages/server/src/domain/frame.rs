//! Wire-independent frames exchanged with a session and events carried by the
//! fan-out bus.
//!
//! JSON representations live in `infrastructure::dto::websocket`.

use super::entity::ChatMessage;
use super::value_object::{Timestamp, UserId};

/// Online/offline status of a user within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Event broadcast to every session subscribed to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    ChatMessage(ChatMessage),
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: Timestamp,
    },
}

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    ChatMessage { content: String },
    Ping,
    HealthCheck,
    /// Valid JSON with an unknown or missing `type`
    Unknown,
    /// Text that is not a JSON object
    Malformed(String),
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    ChatHistory(Vec<ChatMessage>),
    ChatMessage(ChatMessage),
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
        timestamp: Timestamp,
    },
    Ping,
    Pong,
    Error { message: String },
    HealthCheckResponse { healthy: bool },
}

impl OutboundFrame {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            message: message.into(),
        }
    }
}

impl From<&RoomEvent> for OutboundFrame {
    fn from(event: &RoomEvent) -> Self {
        match event {
            RoomEvent::ChatMessage(message) => OutboundFrame::ChatMessage(message.clone()),
            RoomEvent::UserStatus {
                user_id,
                status,
                timestamp,
            } => OutboundFrame::UserStatus {
                user_id: user_id.clone(),
                status: *status,
                timestamp: *timestamp,
            },
        }
    }
}
