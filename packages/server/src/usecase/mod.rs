//! UseCase 層
//!
//! 認証・入室制御・在室管理・メッセージ送信と、それらを束ねる
//! 接続ごとのセッション（[`RoomSession`]）を提供します。
//! 外部コラボレータにはドメイン層の trait を介してのみアクセスします。

pub mod auth_gate;
pub mod connect_participant;
pub mod disconnect_participant;
pub mod error;
pub mod presence_registry;
pub mod rate_limiter;
pub mod send_message;
pub mod session;

pub use auth_gate::{AuthGate, AuthGateConfig, Authenticated};
pub use connect_participant::{Admission, ConnectParticipantUseCase};
pub use disconnect_participant::{Departure, DisconnectParticipantUseCase};
pub use error::{
    AdmissionError, AuthError, CapacityKind, ConnectError, ParticipationError, RuntimeError,
    close_code,
};
pub use presence_registry::{
    AdmitRejection, EvictReason, EvictSignal, PresenceRegistry, RegistryLimits, RegistryStats,
};
pub use rate_limiter::{BucketConfig, LimiterKind, RateLimitConfig, RateLimiter};
pub use send_message::SendMessageUseCase;
pub use session::{
    DrainReason, RoomSession, SessionConfig, SessionContext, SessionHandle, SessionState,
};
