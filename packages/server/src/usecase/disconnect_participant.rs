//! UseCase: 参加者切断処理
//!
//! PresenceRegistry から接続を外し、そのユーザーがルームに残っていなければ
//! オフラインの在室イベントをルームに配信します。
//! 判定と配信は (user, room) の在室ロックの内側で行うため、
//! 同じユーザーの新しい接続のオンライン通知より後にオフライン通知が届くことはありません。

use std::sync::Arc;

use irori_shared::time::Clock;

use crate::domain::{
    ConnectionId, ConnectionRecord, FanoutBus, PresenceStatus, RoomEvent, RoomId, Timestamp,
    UserId,
};

use super::presence_registry::PresenceRegistry;

/// 参加者切断のユースケース
pub struct DisconnectParticipantUseCase {
    registry: Arc<PresenceRegistry>,
    fanout: Arc<dyn FanoutBus>,
    clock: Arc<dyn Clock>,
}

/// 切断の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// この呼び出しで外した記録。先に誰かが外していれば `None`
    pub removed: Option<ConnectionRecord>,
    /// オフライン通知を配信したか
    pub went_offline: bool,
}

impl DisconnectParticipantUseCase {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        fanout: Arc<dyn FanoutBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            fanout,
            clock,
        }
    }

    /// 参加者切断を実行
    ///
    /// 何度呼んでも安全です。登録が既に消えていても、ユーザーがルームに
    /// 残っていなければオフライン通知を行います（掃除やシャットダウンで
    /// 先に削除された場合）。
    pub async fn execute(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Departure {
        let _presence_turn = self.registry.lock_presence(user_id, room_id).await;
        let (removed, pair_held) = self.registry.depart(connection_id, user_id, room_id);

        if pair_held {
            return Departure {
                removed,
                went_offline: false,
            };
        }

        let event = RoomEvent::UserStatus {
            user_id: user_id.clone(),
            status: PresenceStatus::Offline,
            timestamp: Timestamp::new(self.clock.now_millis()),
        };
        let went_offline = match self.fanout.publish(room_id, event).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    room_id = %room_id,
                    "failed to publish offline status: {}",
                    e
                );
                false
            }
        };

        Departure {
            removed,
            went_offline,
        }
    }
}
