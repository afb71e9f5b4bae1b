//! JSON seed data for the in-memory collaborators.
//!
//! ```json
//! {
//!   "users": [{"id": "alice", "username": "Alice"}],
//!   "rooms": [{
//!     "id": "lobby",
//!     "participants": ["alice"],
//!     "messages": [{"sender": "alice", "content": "welcome"}]
//!   }]
//! }
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::domain::{
    Attachment, MessageContent, RoomId, StoreError, UserId, UserProfile, ValueObjectError,
};

use super::{InMemoryMessageStore, InMemoryUserDirectory};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("invalid seed JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value in seed: {0}")]
    Invalid(#[from] ValueObjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub rooms: Vec<SeedRoom>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "active")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedRoom {
    pub id: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub messages: Vec<SeedMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedMessage {
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(default)]
    pub attachment_type: Option<String>,
}

fn active() -> bool {
    true
}

impl Seed {
    pub fn from_json(text: &str) -> Result<Self, SeedError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Two users sharing one room.
    pub fn demo() -> Self {
        let user = |id: &str, username: &str| SeedUser {
            id: id.to_string(),
            username: username.to_string(),
            avatar_url: None,
            is_active: true,
        };
        Self {
            users: vec![user("alice", "Alice"), user("bob", "Bob")],
            rooms: vec![SeedRoom {
                id: "lobby".to_string(),
                participants: vec!["alice".to_string(), "bob".to_string()],
                messages: Vec::new(),
            }],
        }
    }

    /// Populate the directory and the store. Messages are saved in file order.
    pub async fn apply(
        &self,
        directory: &InMemoryUserDirectory,
        store: &InMemoryMessageStore,
    ) -> Result<(), SeedError> {
        for user in &self.users {
            directory
                .insert(UserProfile {
                    id: UserId::new(user.id.clone())?,
                    username: user.username.clone(),
                    avatar_url: user.avatar_url.clone(),
                    is_active: user.is_active,
                })
                .await;
        }

        for room in &self.rooms {
            let room_id = RoomId::new(room.id.clone())?;
            store.create_room(room_id.clone()).await;
            for participant in &room.participants {
                store
                    .add_participant(&room_id, UserId::new(participant.clone())?)
                    .await?;
            }
            for message in &room.messages {
                let attachment = message.attachment.clone().map(|reference| Attachment {
                    reference,
                    kind: message.attachment_type.clone(),
                });
                store
                    .save_with_attachment(
                        &room_id,
                        &UserId::new(message.sender.clone())?,
                        &MessageContent::new(message.content.clone())?,
                        attachment,
                    )
                    .await?;
            }
        }

        tracing::info!(
            users = self.users.len(),
            rooms = self.rooms.len(),
            "seed data loaded"
        );
        Ok(())
    }
}
