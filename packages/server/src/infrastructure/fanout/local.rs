//! In-process fan-out bus.
//!
//! Subscribers are kept per room behind one `tokio::sync::Mutex`. Publishing
//! hands an `Arc` of the event to every channel while holding the lock, so
//! all subscribers of a room see events in the same order.
//!
//! Delivery uses `try_send`: publishing never waits on a slow subscriber.
//! A subscriber whose channel is full is removed from the room, which closes
//! its channel once the buffered events are read.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc::error::TrySendError};

use crate::domain::{ConnectionId, EventChannel, FanoutBus, FanoutError, RoomEvent, RoomId};

#[derive(Default)]
pub struct LocalFanoutBus {
    rooms: Mutex<HashMap<RoomId, HashMap<ConnectionId, EventChannel>>>,
}

impl LocalFanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, room_id: &RoomId) -> usize {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl FanoutBus for LocalFanoutBus {
    async fn publish(&self, room_id: &RoomId, event: RoomEvent) -> Result<usize, FanoutError> {
        let event = Arc::new(event);
        let mut rooms = self.rooms.lock().await;
        let Some(subscribers) = rooms.get_mut(room_id) else {
            return Ok(0);
        };

        // 受信側が閉じたチャンネルと、追いつけない購読者はここで取り除く
        let before = subscribers.len();
        subscribers.retain(|subscriber, channel| match channel.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    room_id = %room_id,
                    connection_id = %subscriber,
                    "dropping lagging subscriber"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %subscriber, "dropping closed subscriber");
                false
            }
        });
        let delivered = subscribers.len();
        if delivered < before {
            tracing::debug!(room_id = %room_id, dropped = before - delivered, "pruned subscribers");
        }
        if subscribers.is_empty() {
            rooms.remove(room_id);
        }
        Ok(delivered)
    }

    async fn subscribe(
        &self,
        room_id: &RoomId,
        subscriber: ConnectionId,
        channel: EventChannel,
    ) -> Result<(), FanoutError> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id.clone())
            .or_default()
            .insert(subscriber, channel);
        tracing::debug!(room_id = %room_id, connection_id = %subscriber, "subscribed");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        room_id: &RoomId,
        subscriber: &ConnectionId,
    ) -> Result<(), FanoutError> {
        let mut rooms = self.rooms.lock().await;
        if let Some(subscribers) = rooms.get_mut(room_id) {
            subscribers.remove(subscriber);
            if subscribers.is_empty() {
                rooms.remove(room_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::{PresenceStatus, Timestamp, UserId};

    fn room(id: &str) -> RoomId {
        RoomId::new(id.to_string()).unwrap()
    }

    fn status_event(user: &str, millis: i64) -> RoomEvent {
        RoomEvent::UserStatus {
            user_id: UserId::new(user.to_string()).unwrap(),
            status: PresenceStatus::Online,
            timestamp: Timestamp::new(millis),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_of_the_room_only() {
        // テスト項目: 同じルームの購読者全員に届き、他のルームには届かない
        // given (前提条件):
        let bus = LocalFanoutBus::new();
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let (tx_other, mut rx_other) = mpsc::channel(16);
        bus.subscribe(&room("r1"), ConnectionId::generate(), tx_a).await.unwrap();
        bus.subscribe(&room("r1"), ConnectionId::generate(), tx_b).await.unwrap();
        bus.subscribe(&room("r2"), ConnectionId::generate(), tx_other).await.unwrap();

        // when (操作):
        let delivered = bus.publish(&room("r1"), status_event("alice", 1)).await.unwrap();

        // then (期待する結果):
        assert_eq!(delivered, 2);
        assert_eq!(*rx_a.recv().await.unwrap(), status_event("alice", 1));
        assert_eq!(*rx_b.recv().await.unwrap(), status_event("alice", 1));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        // テスト項目: 1 つのルーム内では publish 順に届く
        // given (前提条件):
        let bus = LocalFanoutBus::new();
        let (tx, mut rx) = mpsc::channel(16);
        bus.subscribe(&room("r1"), ConnectionId::generate(), tx).await.unwrap();

        // when (操作):
        for i in 0..10 {
            bus.publish(&room("r1"), status_event("alice", i)).await.unwrap();
        }

        // then (期待する結果):
        for i in 0..10 {
            assert_eq!(*rx.recv().await.unwrap(), status_event("alice", i));
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_and_closed_channels_stop_delivery() {
        // テスト項目: 購読解除したものと受信側が閉じたものには配信されない
        // given (前提条件):
        let bus = LocalFanoutBus::new();
        let leaving = ConnectionId::generate();
        let (tx_leaving, mut rx_leaving) = mpsc::channel(16);
        let (tx_dropped, rx_dropped) = mpsc::channel(16);
        bus.subscribe(&room("r1"), leaving, tx_leaving).await.unwrap();
        bus.subscribe(&room("r1"), ConnectionId::generate(), tx_dropped).await.unwrap();
        drop(rx_dropped);

        // when (操作):
        bus.unsubscribe(&room("r1"), &leaving).await.unwrap();
        let delivered = bus.publish(&room("r1"), status_event("alice", 1)).await.unwrap();

        // then (期待する結果):
        assert_eq!(delivered, 0);
        assert!(rx_leaving.try_recv().is_err());
        assert_eq!(bus.subscriber_count(&room("r1")).await, 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_dropped_without_blocking_others() {
        // テスト項目: バッファが埋まった購読者は外され、他の購読者への配信は止まらない
        // given (前提条件): 容量 2 で読まない購読者と、読み続ける購読者
        let bus = LocalFanoutBus::new();
        let slow = ConnectionId::generate();
        let (tx_slow, mut rx_slow) = mpsc::channel(2);
        let (tx_fast, mut rx_fast) = mpsc::channel(16);
        bus.subscribe(&room("r1"), slow, tx_slow).await.unwrap();
        bus.subscribe(&room("r1"), ConnectionId::generate(), tx_fast).await.unwrap();

        // when (操作):
        let mut delivered = Vec::new();
        for i in 0..4 {
            delivered.push(bus.publish(&room("r1"), status_event("alice", i)).await.unwrap());
        }

        // then (期待する結果): 3 件目で遅い購読者が外れ、バッファ分を読むとチャンネルが閉じる
        assert_eq!(delivered, vec![2, 2, 1, 1]);
        assert_eq!(bus.subscriber_count(&room("r1")).await, 1);
        assert_eq!(*rx_slow.recv().await.unwrap(), status_event("alice", 0));
        assert_eq!(*rx_slow.recv().await.unwrap(), status_event("alice", 1));
        assert!(rx_slow.recv().await.is_none());
        for i in 0..4 {
            assert_eq!(*rx_fast.recv().await.unwrap(), status_event("alice", i));
        }
    }
}
