//! UseCase: メッセージ送信処理
//!
//! メッセージを MessageStore に保存し、保存されたメッセージをルームに配信します。
//! 保存は冪等ではないためリトライしません。

use std::sync::Arc;

use crate::domain::{ChatMessage, FanoutBus, MessageContent, MessageStore, RoomEvent, RoomId, UserId};

use super::error::RuntimeError;

/// メッセージ送信のユースケース
pub struct SendMessageUseCase {
    store: Arc<dyn MessageStore>,
    fanout: Arc<dyn FanoutBus>,
}

impl SendMessageUseCase {
    pub fn new(store: Arc<dyn MessageStore>, fanout: Arc<dyn FanoutBus>) -> Self {
        Self { store, fanout }
    }

    /// メッセージ送信を実行
    ///
    /// # Returns
    ///
    /// * `Ok(ChatMessage)` - 保存されたメッセージ
    /// * `Err(RuntimeError)` - 保存に失敗した（配信はされていない）
    ///
    /// 配信の失敗はログに残すだけで、保存済みのメッセージは履歴から取得できます。
    pub async fn execute(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: MessageContent,
    ) -> Result<ChatMessage, RuntimeError> {
        let message = self
            .store
            .save(room_id, sender_id, &content)
            .await
            .inspect_err(|e| {
                tracing::warn!(room_id = %room_id, user_id = %sender_id, "failed to save message: {}", e);
            })?;

        match self
            .fanout
            .publish(room_id, RoomEvent::ChatMessage(message.clone()))
            .await
        {
            Ok(delivered) => {
                tracing::debug!(room_id = %room_id, message_id = %message.id, delivered, "message published");
            }
            Err(e) => {
                tracing::warn!(room_id = %room_id, message_id = %message.id, "failed to publish message: {}", e);
            }
        }

        Ok(message)
    }
}
