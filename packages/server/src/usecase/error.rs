//! UseCase 層のエラー定義
//!
//! 接続試行を終了させるエラーはすべて [`ConnectError`] に集約され、
//! クライアントへ返すクローズコードと理由文字列に対応付けられます。

use std::fmt;

use thiserror::Error;

use crate::domain::{DirectoryError, StoreError, VerifyError};

/// WebSocket のクローズフレームに載せるアプリケーションのクローズコード
pub mod close_code {
    /// クライアントからの通常の切断
    pub const NORMAL: u16 = 1000;
    /// サーバー停止中
    pub const GOING_AWAY: u16 = 1001;
    /// 資格情報がない、または不正・期限切れ
    pub const CREDENTIAL: u16 = 4001;
    /// ルームの参加者でない、またはルームが存在しない
    pub const PARTICIPATION: u16 = 4002;
    /// プロトコル外のフレーム
    pub const PROTOCOL: u16 = 4003;
    /// ping の失敗または無通信
    pub const LIVENESS: u16 = 4008;
    /// 同じユーザー・ルームの新しい接続に置き換えられた
    pub const REPLACED: u16 = 4009;
    /// 接続数の上限、または接続試行が多すぎる
    pub const CAPACITY: u16 = 4029;
    /// 登録の失敗、または依存先の異常
    pub const INTERNAL: u16 = 4500;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    Missing,
    #[error("Malformed credential")]
    Malformed,
    #[error("Credential has expired")]
    Expired,
    #[error("Invalid credential signature")]
    InvalidSignature,
    #[error("Invalid credential claims: {0}")]
    InvalidClaims(String),
    #[error("Unknown user")]
    UnknownSubject,
    #[error("User is inactive")]
    InactiveSubject,
    #[error("User lookup failed: {0}")]
    LookupFailed(String),
}

impl From<VerifyError> for AuthError {
    fn from(error: VerifyError) -> Self {
        match error {
            VerifyError::Malformed => AuthError::Malformed,
            VerifyError::Expired => AuthError::Expired,
            VerifyError::InvalidSignature => AuthError::InvalidSignature,
            VerifyError::IssuedInFuture | VerifyError::MissingClaim(_) => {
                AuthError::InvalidClaims(error.to_string())
            }
        }
    }
}

impl From<DirectoryError> for AuthError {
    fn from(error: DirectoryError) -> Self {
        AuthError::LookupFailed(error.to_string())
    }
}

/// 接続を拒否した上限の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    Global,
    Room,
    User,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapacityKind::Global => "server",
            CapacityKind::Room => "room",
            CapacityKind::User => "user",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Connection limit exceeded ({0})")]
    CapacityExceeded(CapacityKind),
    #[error("Too many connection attempts")]
    RateLimited,
    #[error("Connection registration failed: {0}")]
    RegistrationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipationError {
    #[error("Not a participant of this room")]
    NotAParticipant,
    #[error("Room not found")]
    RoomNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),
    #[error("Message queue is full, please slow down")]
    QueueFull,
    #[error("Failed to send to client: {0}")]
    TransportSendFailed(String),
}

impl From<StoreError> for RuntimeError {
    fn from(error: StoreError) -> Self {
        RuntimeError::DownstreamUnavailable(error.to_string())
    }
}

/// 接続試行を終了させるエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Participation(#[from] ParticipationError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ConnectError {
    pub fn close_code(&self) -> u16 {
        match self {
            ConnectError::Auth(AuthError::LookupFailed(_)) => close_code::INTERNAL,
            ConnectError::Auth(_) => close_code::CREDENTIAL,
            ConnectError::Participation(_) => close_code::PARTICIPATION,
            ConnectError::Admission(AdmissionError::RegistrationFailed(_)) => {
                close_code::INTERNAL
            }
            ConnectError::Admission(_) => close_code::CAPACITY,
            ConnectError::Runtime(_) => close_code::INTERNAL,
        }
    }

    /// クローズフレームと一緒に送る理由の文字列
    pub fn reason(&self) -> String {
        match self {
            // 内部の詳細はサーバーログにだけ残す
            ConnectError::Auth(AuthError::LookupFailed(_))
            | ConnectError::Admission(AdmissionError::RegistrationFailed(_))
            | ConnectError::Runtime(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}
