//! Shared application state.

use std::sync::Arc;

use tokio_util::task::TaskTracker;

use crate::usecase::{PresenceRegistry, SessionContext};

pub struct AppState {
    /// 全セッションが共有するコラボレータと設定
    pub sessions: Arc<SessionContext>,
    /// 接続中のセッションタスク（シャットダウン時に終了を待つ）
    pub tracker: TaskTracker,
}

impl AppState {
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.sessions.registry
    }
}
