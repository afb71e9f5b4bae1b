//! WebSocket connection handler.
//!
//! The upgrade always completes. Authentication, admission and participation
//! failures are reported to the client through the close code.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ConnectInfo, Path, Query, State,
        rejection::QueryRejection,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header::USER_AGENT},
    response::Response,
};
use futures_util::StreamExt;
use serde::Deserialize;

use crate::{
    domain::{ConnectionMetadata, FrameSink, RoomId},
    infrastructure::transport::{WebSocketFrameSink, websocket_events},
    ui::state::AppState,
    usecase::{RoomSession, close_code},
};

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<ConnectQuery>, QueryRejection>,
) -> Response {
    let credential = match query {
        Ok(Query(query)) => query.token,
        Err(e) => {
            tracing::debug!("ignoring unparsable query string: {}", e);
            None
        }
    };
    let metadata = ConnectionMetadata {
        client_addr: Some(addr.to_string()),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        display_name: None,
    };

    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handle_socket(socket, state, room_id, credential, metadata))
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    room_id: String,
    credential: Option<String>,
    metadata: ConnectionMetadata,
) {
    let (sender, receiver) = socket.split();
    let sink: Arc<dyn FrameSink> = Arc::new(WebSocketFrameSink::new(sender));

    let room_id = match RoomId::new(room_id) {
        Ok(room_id) => room_id,
        Err(e) => {
            tracing::warn!("invalid room id: {}", e);
            sink.close(close_code::PARTICIPATION, "Room not found").await;
            return;
        }
    };

    // 失敗時は connect の中でクローズ済み
    let Ok(session) = RoomSession::connect(
        state.sessions.clone(),
        sink,
        credential.as_deref(),
        room_id,
        metadata,
    )
    .await
    else {
        return;
    };

    let connection_id = session.connection_id();
    let reason = session.supervise(websocket_events(receiver)).await;
    tracing::info!(
        connection_id = %connection_id,
        code = reason.close_code(),
        "connection finished: {:?}",
        reason
    );
}
