//! axum WebSocket adapter for the session transport seam.
//!
//! The socket is split: the sink half sits behind a `tokio::sync::Mutex` so
//! the session driver and its child tasks can share it, and the stream half is
//! mapped into [`TransportEvent`]s.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::Mutex;

use crate::{
    domain::{FrameSink, OutboundFrame, TransportError, TransportEvent},
    infrastructure::dto::{encode_outbound, parse_inbound},
};

/// Ceiling on delivering the close frame to a peer that stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebSocketFrameSink {
    sender: Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WebSocketFrameSink {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sender: Mutex::new(sender),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FrameSink for WebSocketFrameSink {
    async fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let text = encode_outbound(&frame).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let mut sender = self.sender.lock().await;
        sender
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let closing = async {
            let mut sender = self.sender.lock().await;
            if let Err(e) = sender.send(Message::Close(Some(frame))).await {
                tracing::debug!("failed to send close frame: {}", e);
            }
            let _ = sender.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            tracing::warn!(code, "close frame not delivered within {:?}", CLOSE_TIMEOUT);
        }
    }
}

/// Map the inbound half of a socket into transport events.
///
/// The stream ends after the first `Closed` or `Error` event.
pub fn websocket_events(
    receiver: SplitStream<WebSocket>,
) -> impl Stream<Item = TransportEvent> + Send + Unpin {
    let mut finished = false;
    receiver
        .map(|message| match message {
            Ok(Message::Text(text)) => TransportEvent::Frame(parse_inbound(text.as_str())),
            Ok(Message::Binary(_)) => TransportEvent::Binary,
            Ok(Message::Ping(_) | Message::Pong(_)) => TransportEvent::Heartbeat,
            Ok(Message::Close(_)) => TransportEvent::Closed,
            Err(e) => TransportEvent::Error(e.to_string()),
        })
        .take_while(move |event| {
            let keep = !finished;
            finished = matches!(event, TransportEvent::Closed | TransportEvent::Error(_));
            futures_util::future::ready(keep)
        })
}
