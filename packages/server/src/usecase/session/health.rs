//! セッションごとの依存先ヘルスチェック
//!
//! ストアと配信の確認は短いタイムアウト付きで実行し、失敗したら 1 回だけ再試行します。
//! 失敗したラウンドはウィンドウ内で数えられ、閾値に達するとセッションを終了させます。

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ConnectionId, FanoutBus, MessageStore, RoomId},
    usecase::presence_registry::PresenceRegistry,
};

use super::{DrainReason, queue::QueueGauge};

/// キュー確認が失敗とみなす充填率
const QUEUE_FILL_LIMIT: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("message store unreachable")]
    Storage,
    #[error("fan-out round trip failed")]
    Fanout,
    #[error("connection missing from presence registry")]
    Registry,
    #[error("message queue nearly full")]
    Queue,
}

#[derive(Debug, Default)]
struct FailureWindow {
    failures: u32,
    last_failure: Option<Instant>,
}

/// ウィンドウ内で失敗したラウンドを数える
#[derive(Debug)]
pub struct HealthMonitor {
    threshold: u32,
    window: Duration,
    state: Mutex<FailureWindow>,
}

impl HealthMonitor {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            state: Mutex::new(FailureWindow::default()),
        }
    }

    /// `now` に失敗したラウンドを記録する。閾値に達したら `true`
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if let Some(last) = state.last_failure
            && now.saturating_duration_since(last) > self.window
        {
            state.failures = 0;
        }
        state.failures += 1;
        state.last_failure = Some(now);
        state.failures >= self.threshold
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.last_failure = None;
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    /// 直近のラウンドが成功したか
    pub fn is_healthy(&self) -> bool {
        self.failures() == 0
    }
}

/// ヘルスチェックの確認対象
pub struct HealthProbes {
    pub store: Arc<dyn MessageStore>,
    pub fanout: Arc<dyn FanoutBus>,
    pub registry: Arc<PresenceRegistry>,
    pub queue: QueueGauge,
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    pub timeout: Duration,
}

impl HealthProbes {
    /// 全項目を確認し、最初の失敗で止める
    pub async fn check(&self) -> Result<(), ProbeFailure> {
        if !probe(self.timeout, || async { self.store.ping().await.is_ok() }).await {
            return Err(ProbeFailure::Storage);
        }
        if !probe(self.timeout, || self.fanout_round_trip()).await {
            return Err(ProbeFailure::Fanout);
        }
        if !self.registry.contains(&self.connection_id) {
            return Err(ProbeFailure::Registry);
        }
        if self.queue.fill_ratio() >= QUEUE_FILL_LIMIT {
            return Err(ProbeFailure::Queue);
        }
        Ok(())
    }

    async fn fanout_round_trip(&self) -> bool {
        let probe_id = ConnectionId::generate();
        let (tx, _rx) = mpsc::channel(1);
        if self
            .fanout
            .subscribe(&self.room_id, probe_id, tx)
            .await
            .is_err()
        {
            return false;
        }
        self.fanout
            .unsubscribe(&self.room_id, &probe_id)
            .await
            .is_ok()
    }
}

async fn probe<F, Fut>(timeout: Duration, mut attempt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..2 {
        if let Ok(true) = tokio::time::timeout(timeout, attempt()).await {
            return true;
        }
    }
    false
}

/// 定期ヘルスチェック。失敗が閾値に達したら `drain_tx` で通知する
pub async fn health_loop(
    probes: HealthProbes,
    monitor: Arc<HealthMonitor>,
    interval: Duration,
    drain_tx: mpsc::UnboundedSender<DrainReason>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match probes.check().await {
            Ok(()) => monitor.record_success(),
            Err(failure) => {
                tracing::warn!(
                    connection_id = %probes.connection_id,
                    failures = monitor.failures() + 1,
                    "health check failed: {}",
                    failure
                );
                if monitor.record_failure(Instant::now()) {
                    let _ = drain_tx.send(DrainReason::HealthCheckFailed(failure.to_string()));
                    return;
                }
            }
        }
    }
}
