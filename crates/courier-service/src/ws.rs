//! WebSocket transport for the notification protocol.
//!
//! One endpoint, text frames only, one JSON object per frame. Inbound
//! frames are validated notification payloads; outbound frames are the live
//! broadcast every connected client receives best-effort. Disconnects are
//! pruned lazily when a send fails.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use courier_schema::{validate, PayloadKind};

use crate::state::AppState;

/// Upgrade handler for `GET /api/v1/ws`.
pub async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    info!("websocket client connected");
    let mut broadcast_rx = state.notify.subscribe();

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_frame(&state, &text).await;
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        let reply = json!({"error_kind": "validation_error", "message": "text frames only"});
                        if socket.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            outbound = broadcast_rx.recv() => {
                match outbound {
                    Ok(notification) => {
                        let frame = match serde_json::to_string(&notification) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "failed to encode broadcast frame");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "websocket client lagging behind broadcast");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!("websocket client disconnected");
}

async fn handle_frame(state: &AppState, text: &str) -> Value {
    let payload: Value = match serde_json::from_str(text) {
        Ok(payload) => payload,
        Err(e) => {
            return json!({"error_kind": "validation_error", "message": format!("invalid JSON: {e}")});
        }
    };
    if let Err(violation) = validate(&payload, PayloadKind::Notification) {
        return json!({
            "error_kind": "validation_error",
            "message": violation.message,
            "path": violation.path,
        });
    }
    let notification = match state.notify.decode(&payload) {
        Ok(notification) => notification,
        Err(e) => {
            return json!({"error_kind": "validation_error", "message": e.to_string()});
        }
    };
    let id = notification.id.clone();
    match state.notify.process(notification).await {
        Ok(outcome) => json!({
            "status": "accepted",
            "notification_id": id,
            "outcome": format!("{outcome:?}").to_lowercase(),
        }),
        Err(e) => json!({"error_kind": "store_unavailable", "message": e.to_string()}),
    }
}
