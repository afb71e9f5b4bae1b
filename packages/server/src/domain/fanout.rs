//! Fan-out bus interface.
//!
//! Publishing delivers an event to every subscriber of a room that is present
//! at publish time. Within one room, subscribers observe events in publish
//! order. Nothing is promised across rooms.
//!
//! Subscriber channels are bounded. A subscriber that cannot keep up is
//! dropped from the room and sees its channel close.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConnectionId, FanoutError, RoomEvent, RoomId};

/// Channel through which a subscriber receives room events.
pub type EventChannel = mpsc::Sender<Arc<RoomEvent>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Deliver `event` to the room's current subscribers. Returns the number
    /// of subscribers the event was handed to.
    async fn publish(&self, room_id: &RoomId, event: RoomEvent) -> Result<usize, FanoutError>;

    /// Subscribe `subscriber` to the room. Subscribing twice replaces the
    /// channel.
    async fn subscribe(
        &self,
        room_id: &RoomId,
        subscriber: ConnectionId,
        channel: EventChannel,
    ) -> Result<(), FanoutError>;

    /// Stop delivering to `subscriber`. Unknown subscribers are ignored.
    async fn unsubscribe(
        &self,
        room_id: &RoomId,
        subscriber: &ConnectionId,
    ) -> Result<(), FanoutError>;
}
