//! ping と無通信タイムアウト
//!
//! アクティビティは受信フレーム、トランスポートのハートビート、
//! 1 周期内に送信が完了した ping のいずれかです。

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ConnectionId, FrameSink, OutboundFrame},
    usecase::presence_registry::PresenceRegistry,
};

use super::DrainReason;

/// 最後にアクティビティを観測した時刻
#[derive(Debug)]
pub struct ActivityTracker {
    last: Mutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// ping ループが扱う接続
pub struct LivenessTarget {
    pub sink: Arc<dyn FrameSink>,
    pub activity: Arc<ActivityTracker>,
    pub registry: Arc<PresenceRegistry>,
    pub connection_id: ConnectionId,
}

impl LivenessTarget {
    fn record_activity(&self) {
        self.activity.touch();
        self.registry.touch(&self.connection_id);
    }
}

/// `ping_interval` ごとに ping を送る
///
/// ping が失敗するか 1 周期内に送り終わらなければ `LivenessProbeFailed`、
/// `inactivity_timeout` の間アクティビティがなければ `InactivityTimeout` を通知します。
pub async fn liveness_loop(
    target: LivenessTarget,
    ping_interval: Duration,
    inactivity_timeout: Duration,
    drain_tx: mpsc::UnboundedSender<DrainReason>,
    cancel: CancellationToken,
) {
    let period = ping_interval.min(inactivity_timeout);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    let mut last_ping = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if target.activity.idle_for() >= inactivity_timeout {
            let _ = drain_tx.send(DrainReason::InactivityTimeout);
            return;
        }
        if last_ping.elapsed() < ping_interval {
            continue;
        }
        last_ping = Instant::now();

        let sent = tokio::select! {
            _ = cancel.cancelled() => return,
            sent = tokio::time::timeout(ping_interval, target.sink.send(OutboundFrame::Ping)) => sent,
        };
        match sent {
            Ok(Ok(())) => target.record_activity(),
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %target.connection_id, "ping failed: {}", e);
                let _ = drain_tx.send(DrainReason::LivenessProbeFailed);
                return;
            }
            Err(_) => {
                tracing::warn!(connection_id = %target.connection_id, "ping not sent within one interval");
                let _ = drain_tx.send(DrainReason::LivenessProbeFailed);
                return;
            }
        }
    }
}
