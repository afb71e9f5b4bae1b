//! InMemory MessageStore 実装
//!
//! ルームごとに参加者集合とメッセージ列を保持します。
//! 送信者のプロフィールは [`InMemoryUserDirectory`] から解決します。

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use irori_shared::time::Clock;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    Attachment, ChatMessage, MessageContent, MessageStore, RoomId, StoreError, Timestamp,
    UserDirectory, UserId, UserProfile,
};

use super::InMemoryUserDirectory;

#[derive(Debug, Default)]
struct RoomData {
    participants: HashSet<UserId>,
    /// 古い順
    messages: Vec<ChatMessage>,
}

pub struct InMemoryMessageStore {
    rooms: Mutex<HashMap<RoomId, RoomData>>,
    directory: Arc<InMemoryUserDirectory>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new(directory: Arc<InMemoryUserDirectory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            directory,
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// ルームを作成（既に存在する場合は何もしない）
    pub async fn create_room(&self, room_id: RoomId) {
        let mut rooms = self.rooms.lock().await;
        rooms.entry(room_id).or_default();
    }

    pub async fn add_participant(&self, room_id: &RoomId, user_id: UserId) -> Result<(), StoreError> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        room.participants.insert(user_id);
        Ok(())
    }

    /// ルームの全メッセージを古い順に取得
    pub async fn messages(&self, room_id: &RoomId) -> Vec<ChatMessage> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(room_id)
            .map(|room| room.messages.clone())
            .unwrap_or_default()
    }

    /// 障害を模擬する。`false` の間はすべての操作が `Unavailable` を返す
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 添付ファイル付きでメッセージを保存
    pub async fn save_with_attachment(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &MessageContent,
        attachment: Option<Attachment>,
    ) -> Result<ChatMessage, StoreError> {
        self.ensure_available()?;
        let sender = self.sender_profile(sender_id).await?;

        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            room_id: room_id.clone(),
            sender,
            content: content.clone(),
            is_read: false,
            attachment,
            created_at: Timestamp::new(self.clock.now_millis()),
        };
        room.messages.push(message.clone());
        Ok(message)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        }
    }

    async fn sender_profile(&self, sender_id: &UserId) -> Result<UserProfile, StoreError> {
        let profile = self
            .directory
            .find_by_id(sender_id)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(profile.unwrap_or_else(|| UserProfile {
            id: sender_id.clone(),
            username: sender_id.to_string(),
            avatar_url: None,
            is_active: true,
        }))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &MessageContent,
    ) -> Result<ChatMessage, StoreError> {
        self.save_with_attachment(room_id, sender_id, content, None)
            .await
    }

    async fn recent(&self, room_id: &RoomId, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        self.ensure_available()?;
        let rooms = self.rooms.lock().await;
        let room = rooms
            .get(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        Ok(room.messages.iter().rev().take(limit).cloned().collect())
    }

    async fn participant_check(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let rooms = self.rooms.lock().await;
        let room = rooms
            .get(room_id)
            .ok_or_else(|| StoreError::RoomNotFound(room_id.to_string()))?;
        Ok(room.participants.contains(user_id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use irori_shared::time::FixedClock;

    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::new(id.to_string()).unwrap()
    }

    fn user(id: &str) -> UserId {
        UserId::new(id.to_string()).unwrap()
    }

    fn content(text: &str) -> MessageContent {
        MessageContent::new(text.to_string()).unwrap()
    }

    async fn create_store() -> InMemoryMessageStore {
        let directory = Arc::new(InMemoryUserDirectory::new());
        directory
            .insert(UserProfile {
                id: user("alice"),
                username: "Alice".to_string(),
                avatar_url: Some("https://example.com/alice.png".to_string()),
                is_active: true,
            })
            .await;
        let store = InMemoryMessageStore::new(directory, Arc::new(FixedClock::new(1_000)));
        store.create_room(room("lobby")).await;
        store.add_participant(&room("lobby"), user("alice")).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_resolves_sender_profile() {
        // テスト項目: 保存したメッセージに送信者のプロフィールと時刻が付く
        // given (前提条件):
        let store = create_store().await;

        // when (操作):
        let saved = store.save(&room("lobby"), &user("alice"), &content("hello")).await.unwrap();

        // then (期待する結果):
        assert_eq!(saved.sender.username, "Alice");
        assert_eq!(saved.created_at, Timestamp::new(1_000));
        assert!(!saved.is_read);
        assert_eq!(store.messages(&room("lobby")).await, vec![saved]);
    }

    #[tokio::test]
    async fn test_recent_returns_newest_first_up_to_limit() {
        // テスト項目: recent は新しい順に最大 limit 件を返す
        // given (前提条件):
        let store = create_store().await;
        for text in ["one", "two", "three"] {
            store.save(&room("lobby"), &user("alice"), &content(text)).await.unwrap();
        }

        // when (操作):
        let recent = store.recent(&room("lobby"), 2).await.unwrap();

        // then (期待する結果):
        let texts: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["three", "two"]);
    }

    #[tokio::test]
    async fn test_participant_check_distinguishes_unknown_room() {
        // テスト項目: 参加者判定と、存在しないルームのエラー
        // given (前提条件):
        let store = create_store().await;

        // when (操作):
        let member = store.participant_check(&room("lobby"), &user("alice")).await;
        let outsider = store.participant_check(&room("lobby"), &user("bob")).await;
        let unknown = store.participant_check(&room("attic"), &user("alice")).await;

        // then (期待する結果):
        assert_eq!(member, Ok(true));
        assert_eq!(outsider, Ok(false));
        assert_eq!(unknown, Err(StoreError::RoomNotFound("attic".to_string())));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        // テスト項目: 障害模擬中は ping と save が失敗する
        // given (前提条件):
        let store = create_store().await;
        store.set_available(false);

        // when (操作):
        let ping = store.ping().await;
        let save = store.save(&room("lobby"), &user("alice"), &content("hi")).await;

        // then (期待する結果):
        assert!(matches!(ping, Err(StoreError::Unavailable(_))));
        assert!(matches!(save, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_save_with_attachment_keeps_reference() {
        // テスト項目: 添付ファイル付きのメッセージが保存される
        // given (前提条件):
        let store = create_store().await;
        let attachment = Attachment {
            reference: "uploads/cat.png".to_string(),
            kind: Some("image".to_string()),
        };

        // when (操作):
        let saved = store
            .save_with_attachment(&room("lobby"), &user("alice"), &content("look"), Some(attachment.clone()))
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(saved.attachment, Some(attachment));
    }
}
