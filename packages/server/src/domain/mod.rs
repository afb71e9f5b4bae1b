//! ドメイン層
//!
//! 値オブジェクト・エンティティ・フレーム定義と、ドメイン層が必要とする
//! 外部コラボレータのインターフェース（trait）を定義します。
//! 具体的な実装は Infrastructure 層が提供します（依存性の逆転）。

pub mod credential;
pub mod entity;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod rate_limit;
pub mod repository;
pub mod transport;
pub mod value_object;

pub use credential::CredentialVerifier;
pub use entity::{Attachment, ChatMessage, Claims, ConnectionMetadata, ConnectionRecord, UserProfile};
pub use error::{
    DirectoryError, FanoutError, StoreError, TransportError, ValueObjectError, VerifyError,
};
pub use fanout::{EventChannel, FanoutBus};
pub use frame::{InboundFrame, OutboundFrame, PresenceStatus, RoomEvent};
pub use rate_limit::TokenBucket;
pub use repository::{MessageStore, UserDirectory};
pub use transport::{FrameSink, TransportEvent};
pub use value_object::{ConnectionId, MessageContent, RoomId, Timestamp, UserId};
