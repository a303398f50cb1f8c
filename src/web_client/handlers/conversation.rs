//! The open conversation: selection, history, sending, read receipts.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::dashboard::DashboardView;
use crate::web_client::handlers::controller;
use crate::web_client::state::SharedState;
use crate::web_client::utils::{dashboard_error, not_signed_in};

fn conversation_body(view: &DashboardView) -> serde_json::Value {
    serde_json::json!({
        "selected": view.selected,
        "messages": view.messages,
        "messages_loading": view.messages_loading,
    })
}

pub async fn get_conversation_handler(State(state): State<SharedState>) -> Response {
    let view = controller(&state).await.snapshot().await;
    if view.caller.is_none() {
        return not_signed_in();
    }
    (StatusCode::OK, axum::Json(conversation_body(&view))).into_response()
}

#[derive(Deserialize)]
pub struct SelectRequest {
    user_id: String,
}

pub async fn select_conversation_handler(
    State(state): State<SharedState>,
    axum::Json(req): axum::Json<SelectRequest>,
) -> Response {
    let controller = controller(&state).await;
    match controller.select(&req.user_id).await {
        Ok(()) => {
            let view = controller.snapshot().await;
            (StatusCode::OK, axum::Json(conversation_body(&view))).into_response()
        }
        Err(e) => dashboard_error(e),
    }
}

pub async fn mark_read_handler(State(state): State<SharedState>) -> Response {
    match controller(&state).await.mark_read().await {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "ok" })),
        )
            .into_response(),
        Err(e) => dashboard_error(e),
    }
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    text: String,
}

/// Accepts the message and returns its provisional copy; the write finishes
/// in the background and is reported over the WebSocket.
pub async fn send_message_handler(
    State(state): State<SharedState>,
    axum::Json(req): axum::Json<SendMessageRequest>,
) -> Response {
    match controller(&state).await.send(&req.text).await {
        Ok(pending) => (StatusCode::ACCEPTED, axum::Json(pending.provisional)).into_response(),
        Err(e) => dashboard_error(e),
    }
}
