//! Profile settings and avatar upload.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::Multipart;
use chrono::Utc;

use crate::backend;
use crate::model::SettingsForm;
use crate::session;
use crate::web_client::config::MAX_AVATAR_SIZE;
use crate::web_client::handlers::controller;
use crate::web_client::state::SharedState;
use crate::web_client::utils::{api_error, backend_error};

pub async fn get_settings_handler(State(state): State<SharedState>) -> Response {
    let controller = controller(&state).await;
    match backend::blocking(controller.backend(), |b| session::current_profile(b)).await {
        Ok(profile) => (StatusCode::OK, axum::Json(profile)).into_response(),
        Err(e) => backend_error(e),
    }
}

pub async fn update_settings_handler(
    State(state): State<SharedState>,
    axum::Json(form): axum::Json<SettingsForm>,
) -> Response {
    if form.username.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "Username is required");
    }
    let controller = controller(&state).await;
    let updated = backend::blocking(controller.backend(), move |b| {
        let me = session::current_profile(b)?;
        session::update_settings(b, &me.email, &form)
    })
    .await;
    match updated {
        Ok(profile) => {
            controller.set_caller(profile.clone()).await;
            (StatusCode::OK, axum::Json(profile)).into_response()
        }
        Err(e) => backend_error(e),
    }
}

/// `POST /api/settings/avatar`: multipart field `file`, image content only.
pub async fn upload_avatar_handler(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Response {
    let mut file_data: Option<Vec<u8>> = None;
    let mut content_type: Option<String> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        content_type = field
            .content_type()
            .map(|ct| ct.to_string())
            .or_else(|| Some("application/octet-stream".to_string()));
        match field.bytes().await {
            Ok(bytes) => {
                if bytes.len() > MAX_AVATAR_SIZE {
                    return api_error(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        format!("avatar exceeds maximum size of {MAX_AVATAR_SIZE} bytes"),
                    );
                }
                file_data = Some(bytes.to_vec());
            }
            Err(e) => {
                return api_error(StatusCode::BAD_REQUEST, format!("failed to read file: {e}"))
            }
        }
    }

    let data = match file_data {
        Some(d) if !d.is_empty() => d,
        _ => return api_error(StatusCode::BAD_REQUEST, "no file provided"),
    };
    let content_type = content_type.unwrap_or_default();
    if !content_type.starts_with("image/") {
        return api_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("avatar must be an image, got {content_type}"),
        );
    }

    let (controller, bucket) = {
        let st = state.lock().await;
        (st.controller.clone(), st.avatar_bucket.clone())
    };
    let uploaded = backend::blocking(controller.backend(), move |b| {
        let me = session::current_profile(b)?;
        let url = session::upload_avatar(b, &bucket, &me, &content_type, data, Utc::now())?;
        let refreshed = session::current_profile(b)?;
        Ok((url, refreshed))
    })
    .await;

    match uploaded {
        Ok((url, profile)) => {
            crate::hlog!(
                "settings: avatar for {} stored at {}",
                crate::logging::user_id(&profile.id),
                url
            );
            controller.set_caller(profile).await;
            (
                StatusCode::CREATED,
                axum::Json(serde_json::json!({ "avatar_url": url })),
            )
                .into_response()
        }
        Err(e) => backend_error(e),
    }
}
