//! Client transport seam used by sessions.

use async_trait::async_trait;

use super::{InboundFrame, OutboundFrame, TransportError};

/// Outbound half of a client connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;

    /// Send a close frame carrying an application close code. Closing an
    /// already closed transport is a no-op.
    async fn close(&self, code: u16, reason: &str);
}

/// Something observed on the inbound half of a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(InboundFrame),
    /// Transport-level ping or pong
    Heartbeat,
    /// Binary payloads are not part of the protocol
    Binary,
    Closed,
    Error(String),
}
