//! UseCase: 参加者接続処理
//!
//! 認証 → 接続試行のレート制限 → ルーム参加者チェック → PresenceRegistry への登録、
//! の順に実行します。同じ (user, room) の接続が既にある場合は、
//! 既存セッションに退去を通知し、その登録が消えるのを上限付きで待ってから登録します。

use std::{sync::Arc, time::Duration};

use crate::domain::{
    Claims, ConnectionId, ConnectionMetadata, ConnectionRecord, MessageStore, RoomId, StoreError,
    UserProfile,
};

use super::{
    auth_gate::AuthGate,
    error::{AdmissionError, ConnectError, ParticipationError, RuntimeError},
    presence_registry::{AdmitRejection, EvictReason, EvictSignal, PresenceRegistry},
    rate_limiter::{LimiterKind, RateLimiter},
};

/// 使用中のペアに対して退去と再試行を繰り返す回数の上限
const MAX_ADMIT_ATTEMPTS: usize = 3;

/// 接続に成功した結果
#[derive(Debug, Clone)]
pub struct Admission {
    pub record: ConnectionRecord,
    pub profile: UserProfile,
    pub claims: Claims,
    /// 登録側がこの接続の退去を求めると発火する
    pub evict_signal: Arc<EvictSignal>,
    /// この接続のために退去させた接続
    pub replaced: Option<ConnectionId>,
}

/// 参加者接続のユースケース
pub struct ConnectParticipantUseCase {
    auth_gate: Arc<AuthGate>,
    rate_limiter: Arc<RateLimiter>,
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn MessageStore>,
    /// 既存セッションの後片付けを待つ上限時間
    eviction_wait: Duration,
}

impl ConnectParticipantUseCase {
    pub fn new(
        auth_gate: Arc<AuthGate>,
        rate_limiter: Arc<RateLimiter>,
        registry: Arc<PresenceRegistry>,
        store: Arc<dyn MessageStore>,
        eviction_wait: Duration,
    ) -> Self {
        Self {
            auth_gate,
            rate_limiter,
            registry,
            store,
            eviction_wait,
        }
    }

    /// 参加者接続を実行
    ///
    /// # Arguments
    ///
    /// * `credential` - クエリパラメータから取り出した bearer credential
    /// * `room_id` - 接続先のルーム
    /// * `metadata` - クライアントアドレスや User-Agent
    ///
    /// # Returns
    ///
    /// * `Ok(Admission)` - 登録済みの接続
    /// * `Err(ConnectError)` - 接続を終了させるべきエラー（クローズコード付き）
    pub async fn execute(
        &self,
        credential: Option<&str>,
        room_id: RoomId,
        mut metadata: ConnectionMetadata,
    ) -> Result<Admission, ConnectError> {
        // 1. 認証
        let authenticated = self.auth_gate.authenticate(credential).await?;
        let user_id = authenticated.profile.id.clone();

        // 2. 接続試行のレート制限
        if !self
            .rate_limiter
            .try_acquire(&user_id, LimiterKind::ConnectionAttempt)
        {
            return Err(AdmissionError::RateLimited.into());
        }

        // 3. ルーム参加者チェック
        match self.store.participant_check(&room_id, &user_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(user_id = %user_id, room_id = %room_id, "not a room participant");
                return Err(ParticipationError::NotAParticipant.into());
            }
            Err(StoreError::RoomNotFound(_)) => {
                return Err(ParticipationError::RoomNotFound.into());
            }
            Err(e) => return Err(RuntimeError::from(e).into()),
        }

        // 4. PresenceRegistry に登録（必要なら既存接続を退去させる）
        metadata.display_name = Some(authenticated.profile.username.clone());
        let connection_id = ConnectionId::generate();
        let mut replaced = None;
        for _ in 0..MAX_ADMIT_ATTEMPTS {
            match self.registry.admit(
                user_id.clone(),
                room_id.clone(),
                connection_id,
                metadata.clone(),
            ) {
                Ok(evict_signal) => {
                    let record = self.registry.connection(&connection_id).ok_or_else(|| {
                        AdmissionError::RegistrationFailed("record vanished after admit".into())
                    })?;
                    return Ok(Admission {
                        record,
                        profile: authenticated.profile,
                        claims: authenticated.claims,
                        evict_signal,
                        replaced,
                    });
                }
                Err(AdmitRejection::Capacity(kind)) => {
                    return Err(AdmissionError::CapacityExceeded(kind).into());
                }
                Err(AdmitRejection::Occupied(existing)) => {
                    self.evict(existing).await;
                    replaced = Some(existing);
                }
                Err(rejection) => {
                    return Err(AdmissionError::RegistrationFailed(rejection.to_string()).into());
                }
            }
        }

        Err(AdmissionError::RegistrationFailed(
            "connection slot kept being taken by another session".into(),
        )
        .into())
    }

    /// `existing` を持つセッションに終了を通知し、登録が消えるのを上限付きで待つ
    ///
    /// 上限を過ぎたらここで登録を外します。
    async fn evict(&self, existing: ConnectionId) {
        tracing::info!(
            connection_id = %existing,
            "evicting previous connection for the same user and room"
        );
        self.registry.signal_eviction(&existing, EvictReason::Replaced);
        if !self
            .registry
            .wait_for_removal(&existing, self.eviction_wait)
            .await
        {
            tracing::warn!(
                connection_id = %existing,
                wait_ms = self.eviction_wait.as_millis() as u64,
                "previous connection did not clean up in time, removing it"
            );
            self.registry.remove(&existing);
        }
    }
}
