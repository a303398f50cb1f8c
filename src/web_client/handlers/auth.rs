//! Sign-up, sign-in, sign-out and password reset.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde::Deserialize;

use crate::backend;
use crate::model::{ResetPasswordForm, SignInForm, SignUpForm};
use crate::session::{self, AuthOutcome};
use crate::web_client::handlers::controller;
use crate::web_client::state::SharedState;
use crate::web_client::sync::persist_session;
use crate::web_client::utils::{api_error, backend_error, reset_error};

fn outcome_response(outcome: AuthOutcome, ok: StatusCode, failed: StatusCode) -> Response {
    if outcome.is_success() {
        (ok, axum::Json(outcome)).into_response()
    } else {
        api_error(failed, outcome.status)
    }
}

pub async fn sign_up_handler(
    State(state): State<SharedState>,
    axum::Json(form): axum::Json<SignUpForm>,
) -> Response {
    let controller = controller(&state).await;
    let outcome = backend::blocking(controller.backend(), move |b| {
        Ok(session::sign_up(b, &form, Utc::now()))
    })
    .await;
    match outcome {
        Ok(outcome) => outcome_response(outcome, StatusCode::CREATED, StatusCode::BAD_REQUEST),
        Err(e) => backend_error(e),
    }
}

/// Sign in, persist the session, and mount the dashboard for the new user.
pub async fn sign_in_handler(
    State(state): State<SharedState>,
    axum::Json(form): axum::Json<SignInForm>,
) -> Response {
    let controller = controller(&state).await;
    let outcome = backend::blocking(controller.backend(), move |b| {
        Ok(session::sign_in(b, &form, Utc::now()))
    })
    .await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => return backend_error(e),
    };
    if !outcome.is_success() {
        return api_error(StatusCode::UNAUTHORIZED, outcome.status);
    }

    {
        let st = state.lock().await;
        persist_session(&controller, &st.storage);
    }
    controller.unmount().await;
    if let Err(e) = controller.mount().await {
        crate::hlog!("auth: dashboard mount after sign-in failed: {}", e);
    }
    (StatusCode::OK, axum::Json(outcome)).into_response()
}

pub async fn sign_out_handler(State(state): State<SharedState>) -> Response {
    let controller = controller(&state).await;
    controller.unmount().await;
    let signed_out =
        backend::blocking(controller.backend(), |b| session::sign_out(b, Utc::now())).await;
    {
        let st = state.lock().await;
        if let Err(e) = st.storage.clear_session() {
            crate::hlog!("session: could not clear: {}", e);
        }
    }
    match signed_out {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "signed_out" })),
        )
            .into_response(),
        Err(e) => backend_error(e),
    }
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    email: String,
}

pub async fn forgot_password_handler(
    State(state): State<SharedState>,
    axum::Json(req): axum::Json<ForgotPasswordRequest>,
) -> Response {
    let controller = controller(&state).await;
    let email = req.email;
    match backend::blocking(controller.backend(), move |b| {
        session::request_password_reset(b, &email)
    })
    .await
    {
        Ok(()) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "sent" })),
        )
            .into_response(),
        Err(e) => backend_error(e),
    }
}

pub async fn reset_password_handler(
    State(state): State<SharedState>,
    axum::Json(form): axum::Json<ResetPasswordForm>,
) -> Response {
    let controller = controller(&state).await;
    let reset = tokio::task::spawn_blocking({
        let backend = controller.backend().clone();
        move || session::reset_password(backend.as_ref(), &form)
    })
    .await;
    match reset {
        Ok(Ok(())) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "status": "success" })),
        )
            .into_response(),
        Ok(Err(e)) => reset_error(e),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
