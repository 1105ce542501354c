//! The client bus: WebSocket duplex sessions plus the small HTTP surface
//! (health, push subscription registration).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use cortex_notify::ClientSession;

use crate::app::AppState;
use crate::events::{ClientMessage, ServerEvent};
use crate::turn;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/push/public-key", get(push_public_key))
        .route("/push/subscribe", post(push_subscribe))
        .route("/restart", post(restart_server))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connected_clients": state.client_sessions.len(),
        "live_turns": state.live_turns.len(),
    }))
}

async fn push_public_key(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"publicKey": state.push.public_key()}))
}

async fn push_subscribe(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    match serde_json::from_value::<cortex_notify::PushSubscription>(body) {
        Ok(subscription) => match state.push.add_subscription(subscription) {
            Ok(()) => Json(serde_json::json!({"ok": true})),
            Err(e) => Json(serde_json::json!({"ok": false, "error": e.to_string()})),
        },
        Err(e) => Json(serde_json::json!({"ok": false, "error": format!("bad subscription: {e}")})),
    }
}

/// POST /restart — the primary agent's self-restart tool. Writes the
/// continuation marker, spawns the start script, and shuts this process
/// down; the next boot replays the continuation prompt.
async fn restart_server(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let Some(session_id) = body.get("session_id").and_then(serde_json::Value::as_str) else {
        return Json(serde_json::json!({"ok": false, "error": "session_id required"}));
    };
    let reason = body.get("reason").and_then(serde_json::Value::as_str);
    match crate::restart::initiate_restart(&state, session_id, reason) {
        Ok(()) => Json(serde_json::json!({"ok": true, "message": "restarting"})),
        Err(e) => Json(serde_json::json!({"ok": false, "error": e.to_string()})),
    }
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let conn_id = cortex_core::ids::short_id();
    info!(conn = %conn_id, "client connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.client_txs.insert(conn_id.clone(), tx);
    state.client_sessions.insert(
        conn_id.clone(),
        ClientSession {
            last_heartbeat: cortex_core::time::now_unix(),
            is_active: true,
            current_chat_id: None,
        },
    );

    // Outbound pump: events queued for this client onto the socket.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound loop.
    while let Some(frame) = stream.next().await {
        let Ok(frame) = frame else { break };
        let text = match frame {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                debug!(conn = %conn_id, "unparseable client frame: {e}");
                continue;
            }
        };
        handle_client_message(&state, &conn_id, message).await;
    }

    state.client_txs.remove(&conn_id);
    state.client_sessions.remove(&conn_id);
    writer.abort();
    info!(conn = %conn_id, "client disconnected");
}

async fn handle_client_message(state: &Arc<AppState>, conn_id: &str, message: ClientMessage) {
    match message {
        ClientMessage::UserTurn {
            msg_id,
            chat_id,
            content,
        } => {
            let chat_id = chat_id.unwrap_or_else(|| cortex_core::ids::prefixed_id("chat"));
            // If a response is already streaming in this chat, route the
            // message through the live session's injection queue instead of
            // starting a competing turn.
            if let Some(handle) = state.live_turns.get(&chat_id) {
                if handle.inject_tx.try_send(content.clone()).is_ok() {
                    debug!(chat = %chat_id, "message injected into live turn");
                    return;
                }
            }
            let state = state.clone();
            tokio::spawn(async move {
                turn::process_turn(&state, &msg_id, &chat_id, &content, false).await;
            });
        }
        ClientMessage::Heartbeat {
            current_chat_id,
            is_active,
        } => {
            if let Some(mut session) = state.client_sessions.get_mut(conn_id) {
                session.last_heartbeat = cortex_core::time::now_unix();
                session.is_active = is_active;
                session.current_chat_id = current_chat_id;
            }
        }
        ClientMessage::Interrupt { chat_id } => {
            if let Some(handle) = state.live_turns.get(&chat_id) {
                info!(chat = %chat_id, "interrupting live turn");
                handle.cancel.cancel();
            }
        }
        ClientMessage::Inject { chat_id, content } => {
            match state.live_turns.get(&chat_id) {
                Some(handle) => {
                    if handle.inject_tx.try_send(content).is_err() {
                        warn!(chat = %chat_id, "injection queue closed");
                    }
                }
                None => debug!(chat = %chat_id, "inject with no live turn"),
            }
        }
        ClientMessage::PushSubscribe { subscription } => {
            match serde_json::from_value::<cortex_notify::PushSubscription>(subscription) {
                Ok(sub) => {
                    if let Err(e) = state.push.add_subscription(sub) {
                        warn!("push subscribe failed: {e}");
                    }
                }
                Err(e) => warn!("bad push subscription payload: {e}"),
            }
        }
    }
}
