//! ユーザーごとのレート制限
//!
//! (user, 制限の種類) ごとに独立した [`TokenBucket`] を初回利用時に作ります。
//! バケットはシャード化された `DashMap` に置くため、ユーザー同士でロックを奪い合いません。

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::domain::{TokenBucket, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    Message,
    ConnectionAttempt,
}

/// 1 つのバケットの補充レート（トークン/秒）とバースト容量
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub rate: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub message: BucketConfig,
    pub connection_attempt: BucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message: BucketConfig {
                rate: 10.0,
                burst: 20,
            },
            connection_attempt: BucketConfig {
                rate: 2.0,
                burst: 5,
            },
        }
    }
}

impl RateLimitConfig {
    fn bucket(&self, kind: LimiterKind) -> BucketConfig {
        match kind {
            LimiterKind::Message => self.message,
            LimiterKind::ConnectionAttempt => self.connection_attempt,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<(UserId, LimiterKind), TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// ユーザーの `kind` のバケットからトークンを 1 つ取る
    pub fn try_acquire(&self, user_id: &UserId, kind: LimiterKind) -> bool {
        self.try_acquire_at(user_id, kind, 1, now())
    }

    pub fn try_acquire_at(
        &self,
        user_id: &UserId,
        kind: LimiterKind,
        cost: u32,
        now: Instant,
    ) -> bool {
        let bucket_config = self.config.bucket(kind);
        let mut bucket = self
            .buckets
            .entry((user_id.clone(), kind))
            .or_insert_with(|| TokenBucket::new(bucket_config.burst, bucket_config.rate, now));
        let granted = bucket.try_acquire(cost, now);
        drop(bucket);

        if !granted {
            tracing::warn!(user_id = %user_id, kind = ?kind, "rate limit exceeded");
        }
        granted
    }

    /// 満タンに戻り、`idle_for` の間使われていないバケットを捨て、捨てた数を返す
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        self.evict_idle_at(idle_for, now())
    }

    pub fn evict_idle_at(&self, idle_for: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let idle = now.saturating_duration_since(bucket.last_refill()) >= idle_for;
            !(idle && bucket.is_full_at(now))
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            tracing::debug!(evicted, "idle rate limiter buckets dropped");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

// tokio の時計に従うので、時間を止めたテストで補充を進められる
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id.to_string()).unwrap()
    }

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            message: BucketConfig { rate, burst },
            connection_attempt: BucketConfig {
                rate: 2.0,
                burst: 5,
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_twenty_then_one_more_after_a_tenth_of_a_second() {
        // テスト項目: rate=10, capacity=20 で 20 回成功、21 回目は失敗、0.1 秒後に 1 回だけ成功
        // given (前提条件):
        let limiter = limiter(10.0, 20);
        let alice = user("alice");

        // when (操作):
        let granted = (0..20)
            .filter(|_| limiter.try_acquire(&alice, LimiterKind::Message))
            .count();
        let twenty_first = limiter.try_acquire(&alice, LimiterKind::Message);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_sleep = limiter.try_acquire(&alice, LimiterKind::Message);
        let immediately_after = limiter.try_acquire(&alice, LimiterKind::Message);

        // then (期待する結果):
        assert_eq!(granted, 20);
        assert!(!twenty_first);
        assert!(after_sleep);
        assert!(!immediately_after);
    }

    #[test]
    fn test_users_have_independent_buckets() {
        // テスト項目: あるユーザーの枯渇が他のユーザーに影響しない
        // given (前提条件):
        let limiter = limiter(1.0, 2);
        let now = Instant::now();
        let alice = user("alice");
        let bob = user("bob");
        limiter.try_acquire_at(&alice, LimiterKind::Message, 2, now);

        // when (操作):
        let alice_result = limiter.try_acquire_at(&alice, LimiterKind::Message, 1, now);
        let bob_result = limiter.try_acquire_at(&bob, LimiterKind::Message, 1, now);

        // then (期待する結果):
        assert!(!alice_result);
        assert!(bob_result);
    }

    #[test]
    fn test_limiter_kinds_are_independent() {
        // テスト項目: メッセージ用と接続試行用のバケットは別々に管理される
        // given (前提条件):
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let now = Instant::now();
        let alice = user("alice");

        // when (操作):
        let attempts = (0..6)
            .filter(|_| limiter.try_acquire_at(&alice, LimiterKind::ConnectionAttempt, 1, now))
            .count();
        let message = limiter.try_acquire_at(&alice, LimiterKind::Message, 1, now);

        // then (期待する結果):
        assert_eq!(attempts, 5);
        assert!(message);
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_evict_idle_drops_only_refilled_idle_buckets() {
        // テスト項目: 満タンかつ一定時間使われていないバケットだけが破棄される
        // given (前提条件):
        let limiter = limiter(1.0, 10);
        let start = Instant::now();
        limiter.try_acquire_at(&user("idle"), LimiterKind::Message, 1, start);
        limiter.try_acquire_at(&user("busy"), LimiterKind::Message, 10, start + Duration::from_secs(595));

        // when (操作):
        let evicted = limiter.evict_idle_at(Duration::from_secs(300), start + Duration::from_secs(600));

        // then (期待する結果):
        assert_eq!(evicted, 1);
        assert_eq!(limiter.bucket_count(), 1);
    }
}
