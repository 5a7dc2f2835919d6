//! WebSocket session streaming.
//!
//! The client opens `/ws/roundtable` or `/ws/swarm` and sends one JSON
//! request. The server answers `{"type":"started","session_id":...}`, then
//! forwards every event of that session until the final one and closes.

use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use conclave_core::{ConclaveError, ConclaveResult};
use conclave_orchestrator::{RoundtableRequest, SwarmRequest};
use conclave_session::SessionKind;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn roundtable_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_session(socket, state, SessionKind::Roundtable))
}

pub async fn swarm_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_session(socket, state, SessionKind::Swarm))
}

async fn start(state: &AppState, kind: SessionKind, text: &str) -> ConclaveResult<Uuid> {
    let invalid = |e: serde_json::Error| ConclaveError::Config(format!("invalid {kind} request: {e}"));
    match kind {
        SessionKind::Roundtable => {
            let request: RoundtableRequest = serde_json::from_str(text).map_err(invalid)?;
            state.orchestrator.start_roundtable(&request).await
        }
        SessionKind::Swarm => {
            let request: SwarmRequest = serde_json::from_str(text).map_err(invalid)?;
            state.orchestrator.start_swarm(&request).await
        }
    }
}

async fn stream_session(socket: WebSocket, state: Arc<AppState>, kind: SessionKind) {
    let (mut sender, mut receiver) = socket.split();

    let text = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    };

    // Subscribe before starting so no early event is missed.
    let mut events = state.orchestrator.subscribe();
    let session_id = match start(&state, kind, text.as_str()).await {
        Ok(id) => id,
        Err(e) => {
            let body = serde_json::json!({ "type": "error", "message": e.to_string() });
            let _ = sender.send(Message::Text(body.to_string().into())).await;
            let _ = sender.close().await;
            return;
        }
    };
    info!(session_id = %session_id, kind = %kind, "Streaming session");

    let started = serde_json::json!({ "type": "started", "session_id": session_id });
    if sender
        .send(Message::Text(started.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.session_id() == session_id => {
                    let body = match serde_json::to_string(&event) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode session event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(body.into())).await.is_err() {
                        break;
                    }
                    if event.is_final() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "Stream subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!(session_id = %session_id, "Stream client left; session continues");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = sender.close().await;
}
