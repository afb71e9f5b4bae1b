//! RoomSession: 接続ごとのステートマシン
//!
//! ## 状態遷移
//!
//! ```text
//! Connecting -> Admitted -> Active -> Draining -> Closed
//! ```
//!
//! - `Connecting`: トランスポート受付直後。認証と登録を行う
//! - `Admitted`: 登録済み。ルームの配信を購読し、オンライン通知・履歴送信・
//!   子タスク（配信転送、キュー消費、ping、ヘルスチェック）の起動を行う
//! - `Active`: 受信メッセージをレート制限・検証してキューに積む
//! - `Draining`: 子タスクを停止して待ち合わせ、購読解除・登録解除・
//!   オフライン通知・クローズフレーム送信を行う
//! - `Closed`: 終端
//!
//! 子タスクは自分で後片付けをせず、[`DrainReason`] をドライバに送るだけです。
//! 後片付けはドライバの 1 箇所でのみ実行され、状態のロックで二重実行を防ぎます。

mod health;
mod liveness;
mod queue;
mod state;


use std::{sync::Arc, time::Duration};

use futures_util::{Stream, StreamExt};
use irori_shared::time::Clock;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::domain::{
    ConnectionId, ConnectionMetadata, FanoutBus, FrameSink, InboundFrame, MessageContent,
    MessageStore, OutboundFrame, PresenceStatus, RoomEvent, RoomId, Timestamp, TransportError,
    TransportEvent, UserId, ValueObjectError,
};

use super::{
    connect_participant::{Admission, ConnectParticipantUseCase},
    disconnect_participant::DisconnectParticipantUseCase,
    error::{ConnectError, close_code},
    presence_registry::{EvictReason, PresenceRegistry},
    rate_limiter::{LimiterKind, RateLimiter},
    send_message::SendMessageUseCase,
};

pub use health::{HealthMonitor, ProbeFailure};
pub use liveness::ActivityTracker;
pub use queue::{MessageQueue, QueueGauge, message_queue};
pub use state::{InvalidTransition, SessionState};

use health::{HealthProbes, health_loop};
use liveness::{LivenessTarget, liveness_loop};
use queue::MessageQueueReceiver;

/// セッションごとの時間と容量の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub ping_interval: Duration,
    pub inactivity_timeout: Duration,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
    pub health_window: Duration,
    pub probe_timeout: Duration,
    /// ping 以外のフレーム送信とクローズの上限時間
    pub send_timeout: Duration,
    pub queue_capacity: usize,
    /// ルーム配信を受け取るチャンネルの容量
    pub event_buffer: usize,
    pub history_limit: usize,
    /// 後片付けで子タスクの終了を待つ上限時間
    pub task_join_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(300),
            health_interval: Duration::from_secs(60),
            health_failure_threshold: 3,
            health_window: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(10),
            queue_capacity: 100,
            event_buffer: 256,
            history_limit: 50,
            task_join_timeout: Duration::from_secs(2),
        }
    }
}

/// セッションが `Active` を抜けた理由
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    ClientClosed,
    TransportError(String),
    TransportSendFailed(String),
    ProtocolViolation(&'static str),
    LivenessProbeFailed,
    InactivityTimeout,
    HealthCheckFailed(String),
    Evicted(EvictReason),
    SubscribeFailed(String),
    /// ルーム配信に追いつけず購読を外された
    SubscriberLagged,
    TaskPanicked,
    /// [`SessionHandle`] 経由の切断要求
    Requested,
}

impl DrainReason {
    pub fn close_code(&self) -> u16 {
        match self {
            DrainReason::ClientClosed | DrainReason::Requested => close_code::NORMAL,
            DrainReason::ProtocolViolation(_) => close_code::PROTOCOL,
            DrainReason::TransportError(_)
            | DrainReason::TransportSendFailed(_)
            | DrainReason::LivenessProbeFailed
            | DrainReason::InactivityTimeout
            | DrainReason::SubscriberLagged
            | DrainReason::Evicted(EvictReason::Stale) => close_code::LIVENESS,
            DrainReason::Evicted(EvictReason::Replaced | EvictReason::Removed) => {
                close_code::REPLACED
            }
            DrainReason::Evicted(EvictReason::Shutdown) => close_code::GOING_AWAY,
            DrainReason::HealthCheckFailed(_)
            | DrainReason::SubscribeFailed(_)
            | DrainReason::TaskPanicked => close_code::INTERNAL,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            DrainReason::ClientClosed => "Connection closed",
            DrainReason::Requested => "Disconnected",
            DrainReason::ProtocolViolation(detail) => *detail,
            DrainReason::TransportError(_) | DrainReason::TransportSendFailed(_) => {
                "Transport error"
            }
            DrainReason::LivenessProbeFailed => "Ping timeout",
            DrainReason::SubscriberLagged => "Connection too slow",
            DrainReason::InactivityTimeout | DrainReason::Evicted(EvictReason::Stale) => {
                "Inactive connection"
            }
            DrainReason::Evicted(EvictReason::Replaced | EvictReason::Removed) => {
                "Replaced by a newer connection"
            }
            DrainReason::Evicted(EvictReason::Shutdown) => "Server shutting down",
            DrainReason::HealthCheckFailed(_) => "Health check failed",
            DrainReason::SubscribeFailed(_) => "Connection registration failed",
            DrainReason::TaskPanicked => "Internal server error",
        }
    }
}

/// 全セッションが共有するコラボレータ
pub struct SessionContext {
    pub connect: Arc<ConnectParticipantUseCase>,
    pub disconnect: Arc<DisconnectParticipantUseCase>,
    pub send_message: Arc<SendMessageUseCase>,
    pub registry: Arc<PresenceRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub store: Arc<dyn MessageStore>,
    pub fanout: Arc<dyn FanoutBus>,
    pub clock: Arc<dyn Clock>,
    pub config: SessionConfig,
}

/// ドライバの外からセッションの状態を見たり、終了を要求したりするハンドル
#[derive(Clone)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    state: Arc<Mutex<SessionState>>,
    drain_tx: mpsc::UnboundedSender<DrainReason>,
}

impl SessionHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// セッションに終了を要求する。既に終わっていれば `false`
    pub fn request_drain(&self) -> bool {
        self.drain_tx.send(DrainReason::Requested).is_ok()
    }
}

/// ドライバと補助関数が共有するセッションの状態
struct SessionCore {
    ctx: Arc<SessionContext>,
    admission: Admission,
    sink: Arc<dyn FrameSink>,
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
    activity: Arc<ActivityTracker>,
    monitor: Arc<HealthMonitor>,
    drain_tx: mpsc::UnboundedSender<DrainReason>,
}

/// 登録済みの 1 接続
pub struct RoomSession {
    core: SessionCore,
    drain_rx: mpsc::UnboundedReceiver<DrainReason>,
}

impl RoomSession {
    /// `Connecting` フェーズ（認証と登録）を実行
    ///
    /// 失敗した場合はエラーのクローズコードでトランスポートを閉じ、
    /// セッションは `Active` になりません。
    pub async fn connect(
        ctx: Arc<SessionContext>,
        sink: Arc<dyn FrameSink>,
        credential: Option<&str>,
        room_id: RoomId,
        metadata: ConnectionMetadata,
    ) -> Result<Self, ConnectError> {
        let mut state = SessionState::Connecting;

        let admission = match ctx.connect.execute(credential, room_id.clone(), metadata).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::warn!(
                    room_id = %room_id,
                    code = e.close_code(),
                    "connection rejected: {}",
                    e
                );
                sink.close(e.close_code(), &e.reason()).await;
                return Err(e);
            }
        };
        if let Err(e) = state.transition(SessionState::Admitted) {
            tracing::error!("{}", e);
        }

        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        let config = ctx.config;
        Ok(Self {
            core: SessionCore {
                ctx,
                admission,
                sink,
                state: Arc::new(Mutex::new(state)),
                cancel: CancellationToken::new(),
                activity: Arc::new(ActivityTracker::new()),
                monitor: Arc::new(HealthMonitor::new(
                    config.health_failure_threshold,
                    config.health_window,
                )),
                drain_tx,
            },
            drain_rx,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.core.admission.record.connection_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.core.admission.record.user_id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            connection_id: self.connection_id(),
            state: self.core.state.clone(),
            drain_tx: self.core.drain_tx.clone(),
        }
    }

    /// セッションを終了まで駆動し、終了理由を返す
    pub async fn run<S>(self, mut inbound: S) -> DrainReason
    where
        S: Stream<Item = TransportEvent> + Unpin,
    {
        let RoomSession { core, mut drain_rx } = self;
        let mut tasks = JoinSet::new();

        let reason = match core.enter_active(&mut tasks).await {
            Ok(queue) => {
                core.steady_state(&mut inbound, &mut drain_rx, &mut tasks, &queue)
                    .await
            }
            Err(reason) => reason,
        };
        core.teardown(&reason, &mut tasks).await;
        reason
    }

    /// セッションを専用タスクで実行する
    ///
    /// セッション内の panic は呼び出し元に伝播させず、強制的な後片付けに変換します。
    pub async fn supervise<S>(self, inbound: S) -> DrainReason
    where
        S: Stream<Item = TransportEvent> + Send + Unpin + 'static,
    {
        let ctx = self.core.ctx.clone();
        let sink = self.core.sink.clone();
        let state = self.core.state.clone();
        let cancel = self.core.cancel.clone();
        let record = self.core.admission.record.clone();

        match tokio::spawn(self.run(inbound)).await {
            Ok(reason) => reason,
            Err(e) => {
                tracing::error!(
                    connection_id = %record.connection_id,
                    "session task failed: {}",
                    e
                );
                cancel.cancel();
                let mut state = state.lock().await;
                if *state != SessionState::Closed {
                    if let Err(e) = ctx
                        .fanout
                        .unsubscribe(&record.room_id, &record.connection_id)
                        .await
                    {
                        tracing::warn!("failed to unsubscribe after panic: {}", e);
                    }
                    ctx.disconnect
                        .execute(&record.connection_id, &record.user_id, &record.room_id)
                        .await;
                    let reason = DrainReason::TaskPanicked;
                    close_within(sink.as_ref(), &reason, ctx.config.send_timeout).await;
                    *state = SessionState::Closed;
                }
                DrainReason::TaskPanicked
            }
        }
    }
}

impl SessionCore {
    fn connection_id(&self) -> ConnectionId {
        self.admission.record.connection_id
    }

    fn room_id(&self) -> &RoomId {
        &self.admission.record.room_id
    }

    fn user_id(&self) -> &UserId {
        &self.admission.record.user_id
    }

    async fn send(&self, frame: OutboundFrame) -> Result<(), DrainReason> {
        send_within(self.sink.as_ref(), frame, self.ctx.config.send_timeout)
            .await
            .map_err(|e| DrainReason::TransportSendFailed(e.to_string()))
    }

    /// `Admitted` の開始処理。最後に `Active` へ遷移する
    async fn enter_active(&self, tasks: &mut JoinSet<()>) -> Result<MessageQueue, DrainReason> {
        let ctx = &self.ctx;
        let config = ctx.config;

        // 1. ルームの配信を購読
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        ctx.fanout
            .subscribe(self.room_id(), self.connection_id(), event_tx)
            .await
            .map_err(|e| DrainReason::SubscribeFailed(e.to_string()))?;

        // 2. オンライン通知
        // 同じ (user, room) の直前の接続のオフライン通知より後に届くよう、在室ロックの内側で配信する
        let presence_turn = ctx.registry.lock_presence(self.user_id(), self.room_id()).await;
        let online = RoomEvent::UserStatus {
            user_id: self.user_id().clone(),
            status: PresenceStatus::Online,
            timestamp: Timestamp::new(ctx.clock.now_millis()),
        };
        if let Err(e) = ctx.fanout.publish(self.room_id(), online).await {
            tracing::warn!(room_id = %self.room_id(), "failed to publish online status: {}", e);
        }
        drop(presence_turn);

        // 3. 履歴の送信（新しい順で取得し、古い順に並べ替えて送る）
        match ctx.store.recent(self.room_id(), config.history_limit).await {
            Ok(mut messages) => {
                messages.reverse();
                self.send(OutboundFrame::ChatHistory(messages)).await?;
            }
            Err(e) => {
                tracing::warn!(room_id = %self.room_id(), "failed to load history: {}", e);
                self.send(OutboundFrame::error("Failed to load message history"))
                    .await?;
            }
        }

        // 4. 子タスクの起動
        let (queue, queue_rx) = message_queue(config.queue_capacity);
        tasks.spawn(forward_events(
            event_rx,
            self.sink.clone(),
            config.send_timeout,
            self.drain_tx.clone(),
            self.cancel.clone(),
        ));
        tasks.spawn(consume_queue(
            queue_rx,
            ctx.send_message.clone(),
            self.sink.clone(),
            config.send_timeout,
            self.room_id().clone(),
            self.user_id().clone(),
            self.drain_tx.clone(),
            self.cancel.clone(),
        ));
        tasks.spawn(liveness_loop(
            LivenessTarget {
                sink: self.sink.clone(),
                activity: self.activity.clone(),
                registry: ctx.registry.clone(),
                connection_id: self.connection_id(),
            },
            config.ping_interval,
            config.inactivity_timeout,
            self.drain_tx.clone(),
            self.cancel.clone(),
        ));
        tasks.spawn(health_loop(
            HealthProbes {
                store: ctx.store.clone(),
                fanout: ctx.fanout.clone(),
                registry: ctx.registry.clone(),
                queue: queue.gauge(),
                connection_id: self.connection_id(),
                room_id: self.room_id().clone(),
                timeout: config.probe_timeout,
            },
            self.monitor.clone(),
            config.health_interval,
            self.drain_tx.clone(),
            self.cancel.clone(),
        ));

        let mut state = self.state.lock().await;
        if state.transition(SessionState::Active).is_err() {
            return Err(DrainReason::Requested);
        }
        drop(state);

        tracing::info!(
            connection_id = %self.connection_id(),
            user_id = %self.user_id(),
            room_id = %self.room_id(),
            "session active"
        );
        Ok(queue)
    }

    async fn steady_state<S>(
        &self,
        inbound: &mut S,
        drain_rx: &mut mpsc::UnboundedReceiver<DrainReason>,
        tasks: &mut JoinSet<()>,
        queue: &MessageQueue,
    ) -> DrainReason
    where
        S: Stream<Item = TransportEvent> + Unpin,
    {
        let evict = self.admission.evict_signal.clone();
        loop {
            tokio::select! {
                reason = evict.fired() => return DrainReason::Evicted(reason),
                Some(reason) = drain_rx.recv() => return reason,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        tracing::error!(connection_id = %self.connection_id(), "session task panicked");
                        return DrainReason::TaskPanicked;
                    }
                }
                event = inbound.next() => match event {
                    None | Some(TransportEvent::Closed) => return DrainReason::ClientClosed,
                    Some(TransportEvent::Error(e)) => return DrainReason::TransportError(e),
                    Some(TransportEvent::Binary) => {
                        return DrainReason::ProtocolViolation("Binary frames are not supported");
                    }
                    Some(TransportEvent::Heartbeat) => self.record_activity(),
                    Some(TransportEvent::Frame(frame)) => {
                        self.record_activity();
                        if let Err(reason) = self.handle_frame(frame, queue).await {
                            return reason;
                        }
                    }
                },
            }
        }
    }

    fn record_activity(&self) {
        self.activity.touch();
        self.ctx.registry.touch(&self.connection_id());
    }

    async fn handle_frame(&self, frame: InboundFrame, queue: &MessageQueue) -> Result<(), DrainReason> {
        match frame {
            InboundFrame::ChatMessage { content } => {
                if !self
                    .ctx
                    .rate_limiter
                    .try_acquire(self.user_id(), LimiterKind::Message)
                {
                    return self
                        .send(OutboundFrame::error("Rate limit exceeded, please slow down"))
                        .await;
                }
                let content = match MessageContent::new(content) {
                    Ok(content) => content,
                    Err(e) => return self.send(OutboundFrame::error(content_error(&e))).await,
                };
                if let Err(e) = queue.try_enqueue(content) {
                    tracing::warn!(connection_id = %self.connection_id(), "message rejected: {}", e);
                    return self.send(OutboundFrame::error(e.to_string())).await;
                }
                Ok(())
            }
            InboundFrame::Ping => self.send(OutboundFrame::Pong).await,
            InboundFrame::HealthCheck => {
                self.send(OutboundFrame::HealthCheckResponse {
                    healthy: self.monitor.is_healthy(),
                })
                .await
            }
            InboundFrame::Unknown => {
                tracing::debug!(connection_id = %self.connection_id(), "ignoring frame with unknown type");
                Ok(())
            }
            InboundFrame::Malformed(detail) => {
                tracing::debug!(connection_id = %self.connection_id(), "malformed frame: {}", detail);
                self.send(OutboundFrame::error("Invalid JSON format")).await
            }
        }
    }

    /// 唯一の後片付け経路
    async fn teardown(&self, reason: &DrainReason, tasks: &mut JoinSet<()>) {
        let mut state = self.state.lock().await;
        if state.is_terminating() {
            return;
        }
        *state = SessionState::Draining;
        tracing::info!(
            connection_id = %self.connection_id(),
            user_id = %self.user_id(),
            room_id = %self.room_id(),
            reason = ?reason,
            "session draining"
        );

        // 1. 子タスクを停止し、上限時間まで終了を待つ
        self.cancel.cancel();
        let joined = tokio::time::timeout(self.ctx.config.task_join_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            tracing::warn!(connection_id = %self.connection_id(), "session tasks did not stop in time, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        // 2. 購読解除
        if let Err(e) = self
            .ctx
            .fanout
            .unsubscribe(self.room_id(), &self.connection_id())
            .await
        {
            tracing::warn!(connection_id = %self.connection_id(), "failed to unsubscribe: {}", e);
        }

        // 3. 登録解除とオフライン通知
        self.ctx
            .disconnect
            .execute(&self.connection_id(), self.user_id(), self.room_id())
            .await;

        // 4. クローズフレーム
        close_within(self.sink.as_ref(), reason, self.ctx.config.send_timeout).await;

        *state = SessionState::Closed;
        tracing::info!(connection_id = %self.connection_id(), "session closed");
    }
}

fn content_error(error: &ValueObjectError) -> String {
    match error {
        ValueObjectError::Empty(_) => "Message content cannot be empty".to_string(),
        ValueObjectError::TooLong { max, .. } => {
            format!("Message is too long (max {max} characters)")
        }
        ValueObjectError::InvalidCharacter(_) => "Message contains invalid characters".to_string(),
    }
}

/// 送信を `timeout` で打ち切る。時間切れは送信失敗として扱う
async fn send_within(
    sink: &dyn FrameSink,
    frame: OutboundFrame,
    timeout: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(timeout, sink.send(frame))
        .await
        .unwrap_or_else(|_| Err(TransportError::SendFailed("send timed out".to_string())))
}

async fn close_within(sink: &dyn FrameSink, reason: &DrainReason, timeout: Duration) {
    if tokio::time::timeout(timeout, sink.close(reason.close_code(), reason.message()))
        .await
        .is_err()
    {
        tracing::warn!("close frame not sent within {:?}", timeout);
    }
}

async fn forward_events(
    mut events: mpsc::Receiver<Arc<RoomEvent>>,
    sink: Arc<dyn FrameSink>,
    send_timeout: Duration,
    drain_tx: mpsc::UnboundedSender<DrainReason>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            next = events.recv() => match next {
                Some(event) => event,
                // 配信側に外された（追いつけなかった）
                None => {
                    if !cancel.is_cancelled() {
                        let _ = drain_tx.send(DrainReason::SubscriberLagged);
                    }
                    return;
                }
            },
        };
        if let Err(e) = send_within(sink.as_ref(), OutboundFrame::from(event.as_ref()), send_timeout).await {
            let _ = drain_tx.send(DrainReason::TransportSendFailed(e.to_string()));
            return;
        }
    }
}

async fn consume_queue(
    mut queue: MessageQueueReceiver,
    send_message: Arc<SendMessageUseCase>,
    sink: Arc<dyn FrameSink>,
    send_timeout: Duration,
    room_id: RoomId,
    user_id: UserId,
    drain_tx: mpsc::UnboundedSender<DrainReason>,
    cancel: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            _ = cancel.cancelled() => return,
            next = queue.recv() => match next {
                Some(queued) => queued,
                None => return,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = send_message.execute(&room_id, &user_id, queued.content.clone()) => result,
        };
        // 処理が終わってから permit を返す
        drop(queued);

        if result.is_err()
            && let Err(e) = send_within(
                sink.as_ref(),
                OutboundFrame::error("Failed to save message"),
                send_timeout,
            )
            .await
        {
            let _ = drain_tx.send(DrainReason::TransportSendFailed(e.to_string()));
            return;
        }
    }
}
