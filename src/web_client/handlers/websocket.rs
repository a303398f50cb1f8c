//! WebSocket upgrade and the dashboard event stream.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::broadcast;

use crate::web_client::config::MAX_WS_CONNECTIONS;
use crate::web_client::state::SharedState;
use crate::web_client::utils::api_error;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> Response {
    let ws_count = state.lock().await.ws_connection_count.clone();

    if ws_count.load(Ordering::Relaxed) >= MAX_WS_CONNECTIONS {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("too many WebSocket connections (max {MAX_WS_CONNECTIONS})"),
        );
    }

    ws.on_upgrade(|socket| ws_connection(socket, state))
        .into_response()
}

async fn ws_connection(mut socket: WebSocket, state: SharedState) {
    let (mut rx, ws_count, controller) = {
        let st = state.lock().await;
        let count = st.ws_connection_count.clone();
        count.fetch_add(1, Ordering::Relaxed);
        (st.controller.subscribe_events(), count, st.controller.clone())
    };

    // Start every socket from a full snapshot; events after it are deltas.
    let snapshot = serde_json::json!({
        "type": "snapshot",
        "dashboard": controller.snapshot().await,
    });
    let mut open = socket.send(WsMessage::Text(snapshot.to_string())).await.is_ok();

    while open {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            open = socket.send(WsMessage::Text(json)).await.is_ok();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        crate::hlog!("ws client lagged, skipped {n} events");
                        // The browser reloads the dashboard snapshot on this.
                        let lag_msg = serde_json::json!({
                            "type": "events_missed",
                            "count": n,
                        });
                        open = socket.send(WsMessage::Text(lag_msg.to_string())).await.is_ok();
                    }
                    Err(broadcast::error::RecvError::Closed) => open = false,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => open = false,
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = socket.send(WsMessage::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    ws_count.fetch_sub(1, Ordering::Relaxed);
}
