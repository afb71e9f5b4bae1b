//! AuthGate: 接続時の認証
//!
//! ## 処理の流れ
//!
//! 1. 資格情報の形式チェック（暗号処理や DB 参照の前に不正な入力を弾く）
//! 2. キャッシュ参照（資格情報の末尾から作るキー + 全体のダイジェストで照合）
//! 3. 署名と必須クレームの検証（[`CredentialVerifier`]）
//! 4. ユーザーの解決（[`UserDirectory`]）。存在しない・無効なユーザーは拒否
//! 5. キャッシュに保存して返す
//!
//! キャッシュは TTL（既定 5 分）で失効し、上限件数を超えそうになると
//! 失効済みのエントリから順に捨てます。

use std::{collections::HashMap, sync::Arc, time::Duration};

use irori_shared::time::Clock;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::domain::{Claims, CredentialVerifier, UserDirectory, UserProfile};

use super::error::AuthError;

/// キャッシュキーに使う資格情報末尾の文字数
const CACHE_KEY_SUFFIX_LEN: usize = 32;
/// これより長い資格情報は形式不正として拒否する
const MAX_CREDENTIAL_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthGateConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub sweep_interval: Duration,
}

impl Default for AuthGateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// 認証済み接続のユーザーとクレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub profile: UserProfile,
    pub claims: Claims,
}

struct CacheEntry {
    digest: [u8; 32],
    authenticated: Authenticated,
    cached_at: Instant,
}

pub struct AuthGate {
    verifier: Arc<dyn CredentialVerifier>,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    config: AuthGateConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl AuthGate {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        config: AuthGateConfig,
    ) -> Self {
        Self {
            verifier,
            directory,
            clock,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// bearer credential を認証する
    ///
    /// # Returns
    ///
    /// * `Ok(Authenticated)` - 認証成功（キャッシュヒットを含む）
    /// * `Err(AuthError)` - 失敗理由ごとに異なるエラー種別
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Authenticated, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::Missing)?;
        check_shape(credential)?;

        let key = cache_key(credential);
        let digest: [u8; 32] = Sha256::digest(credential.as_bytes()).into();
        if let Some(hit) = self.cached(&key, &digest) {
            tracing::debug!(user_id = %hit.profile.id, "auth cache hit");
            return Ok(hit);
        }

        let claims = self.verifier.verify(credential).inspect_err(|e| {
            tracing::warn!(reason = %e, "credential rejected");
        })?;
        let profile = self
            .directory
            .find_by_id(&claims.subject)
            .await?
            .ok_or(AuthError::UnknownSubject)?;
        if !profile.is_active {
            tracing::warn!(user_id = %profile.id, "inactive user tried to connect");
            return Err(AuthError::InactiveSubject);
        }

        let authenticated = Authenticated { profile, claims };
        self.insert(key, digest, authenticated.clone());
        Ok(authenticated)
    }

    fn cached(&self, key: &str, digest: &[u8; 32]) -> Option<Authenticated> {
        let now_secs = self.clock.now_millis() / 1000;
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        if &entry.digest != digest {
            return None;
        }
        if entry.cached_at.elapsed() >= self.config.ttl
            || entry.authenticated.claims.is_expired_at(now_secs)
        {
            cache.remove(key);
            return None;
        }
        Some(entry.authenticated.clone())
    }

    fn insert(&self, key: String, digest: [u8; 32], authenticated: Authenticated) {
        let ttl = self.config.ttl;
        let mut cache = self.cache.lock();
        if cache.len() >= self.config.max_entries {
            cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        }
        while cache.len() >= self.config.max_entries {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(oldest) => {
                    cache.remove(&oldest);
                }
                None => break,
            }
        }
        if self.config.max_entries > 0 {
            cache.insert(
                key,
                CacheEntry {
                    digest,
                    authenticated,
                    cached_at: Instant::now(),
                },
            );
        }
    }

    /// TTL を過ぎたキャッシュエントリを捨て、捨てた件数を返す
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - cache.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    /// 定期的なキャッシュ掃除を起動する。`shutdown` で止まる
    pub fn start_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let gate = Arc::clone(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = gate.sweep_expired();
                        if dropped > 0 {
                            tracing::debug!(dropped, "auth cache swept");
                        }
                    }
                }
            }
        })
    }
}

/// Compact JWS の形（空でない base64url の 3 セグメント）
fn check_shape(credential: &str) -> Result<(), AuthError> {
    if credential.len() > MAX_CREDENTIAL_LEN {
        return Err(AuthError::Malformed);
    }
    let segments: Vec<&str> = credential.split('.').collect();
    let well_formed = segments.len() == 3
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        });
    if well_formed {
        Ok(())
    } else {
        Err(AuthError::Malformed)
    }
}

fn cache_key(credential: &str) -> String {
    // check_shape で ASCII が保証されているので、バイト単位で切っても文字境界を壊さない
    credential[credential.len().saturating_sub(CACHE_KEY_SUFFIX_LEN)..].to_string()
}
