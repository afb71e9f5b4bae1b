//! Conversion logic between DTOs and domain types.

use irori_shared::time::timestamp_to_rfc3339;

use crate::{
    domain::{ChatMessage, InboundFrame, OutboundFrame, PresenceStatus, RoomId, UserId},
    infrastructure::dto::{http, websocket as dto},
    usecase::RegistryStats,
};

// ========================================
// Wire text → Domain
// ========================================

/// Parse one text frame from a client.
///
/// Text that is not a JSON object is `Malformed`; an object whose `type` is
/// missing or unknown is `Unknown`.
pub fn parse_inbound(text: &str) -> InboundFrame {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return InboundFrame::Malformed(e.to_string()),
    };
    let Some(object) = value.as_object() else {
        return InboundFrame::Malformed("expected a JSON object".to_string());
    };
    let known = object
        .get("type")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|t| dto::ClientMessage::KNOWN_TYPES.contains(&t));
    if !known {
        return InboundFrame::Unknown;
    }

    match serde_json::from_value::<dto::ClientMessage>(value) {
        Ok(message) => message.into(),
        Err(e) => InboundFrame::Malformed(e.to_string()),
    }
}

impl From<dto::ClientMessage> for InboundFrame {
    fn from(message: dto::ClientMessage) -> Self {
        match message {
            dto::ClientMessage::ChatMessage { content } => InboundFrame::ChatMessage { content },
            dto::ClientMessage::Ping => InboundFrame::Ping,
            dto::ClientMessage::HealthCheck => InboundFrame::HealthCheck,
        }
    }
}

// ========================================
// Domain → Wire text
// ========================================

pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(&dto::ServerMessage::from(frame))
}

impl From<&ChatMessage> for dto::MessageView {
    fn from(message: &ChatMessage) -> Self {
        let (attachment, attachment_type) = match &message.attachment {
            Some(attachment) => (Some(attachment.reference.clone()), attachment.kind.clone()),
            None => (None, None),
        };
        Self {
            id: message.id.to_string(),
            content: message.content.as_str().to_string(),
            sender: dto::SenderView {
                id: message.sender.id.to_string(),
                username: message.sender.username.clone(),
                avatar_url: message.sender.avatar_url.clone(),
            },
            created_at: timestamp_to_rfc3339(message.created_at.value()),
            is_read: message.is_read,
            room_id: message.room_id.to_string(),
            attachment,
            attachment_type,
        }
    }
}

impl From<PresenceStatus> for dto::StatusDto {
    fn from(status: PresenceStatus) -> Self {
        match status {
            PresenceStatus::Online => dto::StatusDto::Online,
            PresenceStatus::Offline => dto::StatusDto::Offline,
        }
    }
}

impl From<&OutboundFrame> for dto::ServerMessage {
    fn from(frame: &OutboundFrame) -> Self {
        match frame {
            OutboundFrame::ChatHistory(messages) => dto::ServerMessage::ChatHistory {
                messages: messages.iter().map(dto::MessageView::from).collect(),
            },
            OutboundFrame::ChatMessage(message) => dto::ServerMessage::ChatMessage {
                message: message.into(),
            },
            OutboundFrame::UserStatus {
                user_id,
                status,
                timestamp,
            } => dto::ServerMessage::UserStatus {
                user_id: user_id.to_string(),
                status: (*status).into(),
                timestamp: timestamp_to_rfc3339(timestamp.value()),
            },
            OutboundFrame::Ping => dto::ServerMessage::Ping,
            OutboundFrame::Pong => dto::ServerMessage::Pong,
            OutboundFrame::Error { message } => dto::ServerMessage::Error {
                message: message.clone(),
            },
            OutboundFrame::HealthCheckResponse { healthy } => {
                dto::ServerMessage::HealthCheckResponse { healthy: *healthy }
            }
        }
    }
}

// ========================================
// Registry → HTTP
// ========================================

impl From<RegistryStats> for http::StatsResponse {
    fn from(stats: RegistryStats) -> Self {
        Self {
            total_connections: stats.total_connections,
            total_rooms: stats.total_rooms(),
            total_users: stats.total_users(),
            room_stats: stats
                .room_counts
                .into_iter()
                .map(|(room_id, count)| (room_id.into_string(), count))
                .collect(),
            user_stats: stats
                .user_counts
                .into_iter()
                .map(|(user_id, count)| (user_id.into_string(), count))
                .collect(),
        }
    }
}

impl http::RoomPresenceResponse {
    pub fn new(room_id: &RoomId, online: impl IntoIterator<Item = UserId>) -> Self {
        let online_user_ids: Vec<String> = online.into_iter().map(UserId::into_string).collect();
        Self {
            room_id: room_id.to_string(),
            user_count: online_user_ids.len(),
            online_user_ids,
        }
    }
}
