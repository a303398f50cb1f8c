//! Dashboard snapshot, caller profile, and the filtered roster.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::roster::RosterFilter;
use crate::web_client::handlers::controller;
use crate::web_client::state::SharedState;
use crate::web_client::utils::{dashboard_error, not_signed_in};

pub async fn dashboard_handler(State(state): State<SharedState>) -> Response {
    let controller = controller(&state).await;
    if !controller.is_mounted().await {
        return not_signed_in();
    }
    (StatusCode::OK, axum::Json(controller.snapshot().await)).into_response()
}

pub async fn refresh_handler(State(state): State<SharedState>) -> Response {
    let controller = controller(&state).await;
    if !controller.is_mounted().await {
        return not_signed_in();
    }
    match controller.refresh().await {
        Ok(()) => (StatusCode::OK, axum::Json(controller.snapshot().await)).into_response(),
        Err(e) => dashboard_error(e),
    }
}

pub async fn me_handler(State(state): State<SharedState>) -> Response {
    match controller(&state).await.caller().await {
        Some(profile) => (StatusCode::OK, axum::Json(profile)).into_response(),
        None => not_signed_in(),
    }
}

/// `GET /api/users?search=&online_only=&has_messages=`: applies the filter
/// to the dashboard and returns the visible roster.
pub async fn list_users_handler(
    State(state): State<SharedState>,
    Query(filter): Query<RosterFilter>,
) -> Response {
    let controller = controller(&state).await;
    if !controller.is_mounted().await {
        return not_signed_in();
    }
    let users = controller.set_filter(filter.clone()).await;
    let body = serde_json::json!({
        "filter": filter,
        "count": users.len(),
        "users": users,
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}
