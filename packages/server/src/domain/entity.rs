//! Entities.

use uuid::Uuid;

use super::value_object::{ConnectionId, MessageContent, RoomId, Timestamp, UserId};

/// Free-form information captured when a connection is accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Remote socket address of the client
    pub client_addr: Option<String>,
    /// `User-Agent` header sent with the upgrade request
    pub user_agent: Option<String>,
    /// Display name resolved at authentication time
    pub display_name: Option<String>,
}

/// One live connection, owned by the presence registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    pub metadata: ConnectionMetadata,
}

/// Identity resolved from the user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar_url: Option<String>,
    pub is_active: bool,
}

/// Verified claims carried by a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: UserId,
    /// Issued-at, Unix seconds
    pub issued_at: i64,
    /// Expiry, Unix seconds
    pub expires_at: i64,
}

impl Claims {
    /// Whether the credential has expired at `now_secs`.
    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        self.expires_at <= now_secs
    }
}

/// File attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Storage reference (path or URL) of the file
    pub reference: String,
    /// Coarse type of the file, e.g. "image"
    pub kind: Option<String>,
}

/// A persisted chat message as returned by the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: RoomId,
    pub sender: UserProfile,
    pub content: MessageContent,
    pub is_read: bool,
    pub attachment: Option<Attachment>,
    pub created_at: Timestamp,
}
