//! Repository trait 定義
//!
//! メッセージ永続化とユーザー検索は外部コラボレータです。
//! コアはこの狭いインターフェースのみに依存し、ストレージの内部には関与しません。

use async_trait::async_trait;

use super::{
    ChatMessage, DirectoryError, MessageContent, RoomId, StoreError, UserId, UserProfile,
};

/// Message Store trait
///
/// チャットメッセージ・履歴・ルーム参加者の永続化層へのインターフェース。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// メッセージを保存し、保存されたメッセージを返す
    async fn save(
        &self,
        room_id: &RoomId,
        sender_id: &UserId,
        content: &MessageContent,
    ) -> Result<ChatMessage, StoreError>;

    /// 直近のメッセージを新しい順に最大 `limit` 件取得
    async fn recent(&self, room_id: &RoomId, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    /// ユーザーがルームの参加者かどうか
    ///
    /// ルームが存在しない場合は `StoreError::RoomNotFound` を返す。
    async fn participant_check(&self, room_id: &RoomId, user_id: &UserId)
    -> Result<bool, StoreError>;

    /// ストレージへの疎通確認（ヘルスチェック用）
    async fn ping(&self) -> Result<(), StoreError>;
}

/// User Directory trait
///
/// 認証済みクレームの subject からユーザーを解決する。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// ID でユーザーを検索（存在しない場合は `Ok(None)`）
    async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserProfile>, DirectoryError>;
}
