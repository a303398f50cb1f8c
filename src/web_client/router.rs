//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use crate::web_client::config::MAX_AVATAR_SIZE;
use crate::web_client::handlers;
use crate::web_client::state::SharedState;
use crate::web_client::utils::api_error;

async fn not_found() -> Response {
    api_error(StatusCode::NOT_FOUND, "no such endpoint")
}

/// Build the complete Axum router with all API routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        // Health
        .route("/api/health", get(handlers::health::health_handler))
        // Auth
        .route("/api/auth/signup", post(handlers::auth::sign_up_handler))
        .route("/api/auth/signin", post(handlers::auth::sign_in_handler))
        .route("/api/auth/signout", post(handlers::auth::sign_out_handler))
        .route(
            "/api/auth/forgot-password",
            post(handlers::auth::forgot_password_handler),
        )
        .route(
            "/api/auth/reset-password",
            post(handlers::auth::reset_password_handler),
        )
        // Dashboard and roster
        .route("/api/dashboard", get(handlers::users::dashboard_handler))
        .route("/api/refresh", post(handlers::users::refresh_handler))
        .route("/api/me", get(handlers::users::me_handler))
        .route("/api/users", get(handlers::users::list_users_handler))
        // Conversation
        .route(
            "/api/conversation",
            get(handlers::conversation::get_conversation_handler)
                .put(handlers::conversation::select_conversation_handler),
        )
        .route(
            "/api/conversation/read",
            post(handlers::conversation::mark_read_handler),
        )
        .route(
            "/api/messages",
            post(handlers::conversation::send_message_handler),
        )
        // Settings
        .route(
            "/api/settings",
            get(handlers::settings::get_settings_handler)
                .put(handlers::settings::update_settings_handler),
        )
        .route(
            "/api/settings/avatar",
            post(handlers::settings::upload_avatar_handler)
                .layer(DefaultBodyLimit::max(MAX_AVATAR_SIZE + 4096)),
        )
        // WebSocket
        .route("/api/ws", get(handlers::websocket::ws_handler))
        .fallback(not_found)
        .with_state(state)
}
