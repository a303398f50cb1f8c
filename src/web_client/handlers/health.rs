//! Health check endpoint.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::web_client::state::SharedState;

pub async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let (controller, backend, ws_clients) = {
        let st = state.lock().await;
        (
            st.controller.clone(),
            st.backend_kind,
            st.ws_connection_count.load(Ordering::Relaxed),
        )
    };
    let view = controller.snapshot().await;

    let body = serde_json::json!({
        "status": "ok",
        "backend": backend,
        "signed_in": view.caller.is_some(),
        "user_id": view.caller.as_ref().map(|c| c.id.clone()),
        "realtime": view.realtime,
        "ws_clients": ws_clients,
    });
    (StatusCode::OK, axum::Json(body))
}
