//! セッションのライフサイクル

use thiserror::Error;

/// `Connecting -> Admitted -> Active -> Draining -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// トランスポート受付済み、ユーザーは未確定
    Connecting,
    /// 登録・購読済み、開始処理の実行中
    Admitted,
    Active,
    /// 後片付け中
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Admitted)
                | (Connecting, Closed)
                | (Admitted, Active)
                | (Admitted, Draining)
                | (Active, Draining)
                | (Draining, Closed)
        )
    }

    /// `next` へ遷移する。許されない遷移は拒否する
    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }

    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Draining | SessionState::Closed)
    }
}
