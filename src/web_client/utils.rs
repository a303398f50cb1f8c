//! Shared helpers for the web handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::backend::BackendError;
use crate::dashboard::DashboardError;
use crate::session::ResetError;

/// Build a standard JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, axum::Json(body)).into_response()
}

pub fn backend_status(err: &BackendError) -> StatusCode {
    match err {
        BackendError::Auth(_) => StatusCode::BAD_REQUEST,
        BackendError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        BackendError::NotFound(_) => StatusCode::NOT_FOUND,
        BackendError::Api(_) | BackendError::Transport(_) | BackendError::Decode(_) => {
            StatusCode::BAD_GATEWAY
        }
        BackendError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn backend_error(err: BackendError) -> Response {
    api_error(backend_status(&err), err.to_string())
}

pub fn dashboard_error(err: DashboardError) -> Response {
    let status = match &err {
        DashboardError::Backend(e) => backend_status(e),
        DashboardError::NotSignedIn => StatusCode::UNAUTHORIZED,
        DashboardError::NoConversation => StatusCode::CONFLICT,
        DashboardError::UnknownUser(_) => StatusCode::NOT_FOUND,
        DashboardError::EmptyMessage => StatusCode::BAD_REQUEST,
    };
    api_error(status, err.to_string())
}

pub fn reset_error(err: ResetError) -> Response {
    match err {
        ResetError::Backend(e) => backend_error(e),
        other => api_error(StatusCode::BAD_REQUEST, other.to_string()),
    }
}

pub fn not_signed_in() -> Response {
    api_error(StatusCode::UNAUTHORIZED, BackendError::NotAuthenticated.to_string())
}
