//! Auth actions and the current-user accessor.
//!
//! Sign-up and sign-in report back as an [`AuthOutcome`] whose `status` is
//! either `"success"` or a message fit to show on the form. Everything else
//! returns a `Result`. All calls block; async callers go through
//! [`crate::backend::blocking`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{Backend, BackendError, SignUp};
use crate::model::{
    Identity, NewProfile, Profile, ProfileChanges, ResetPasswordForm, SettingsForm,
    SignInForm, SignUpForm, Status,
};

pub const SUCCESS: &str = "success";
pub const ALREADY_REGISTERED: &str = "User with this email already exists, Please Login!";
pub const MIN_RESET_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthOutcome {
    pub status: String,
    pub user: Option<Identity>,
}

impl AuthOutcome {
    fn success(user: Identity) -> Self {
        Self {
            status: SUCCESS.to_string(),
            user: Some(user),
        }
    }

    fn failed(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            user: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SUCCESS
    }
}

pub fn sign_up(backend: &dyn Backend, form: &SignUpForm, now: DateTime<Utc>) -> AuthOutcome {
    let metadata = serde_json::json!({ "username": form.name });
    let identity = match backend.sign_up(&form.email, &form.password, metadata) {
        Ok(SignUp::Created(identity)) => identity,
        Ok(SignUp::AlreadyRegistered) => return AuthOutcome::failed(ALREADY_REGISTERED),
        Err(e) => return AuthOutcome::failed(e.to_string()),
    };

    let row = NewProfile {
        email: form.email.clone(),
        username: form.name.clone(),
        phone_number: form.phone_number.clone(),
        avatar_url: None,
        groups: Vec::new(),
        last_seen: now,
        status: Status::Offline,
    };
    if let Err(e) = backend.insert_profile(&row) {
        return AuthOutcome::failed(format!("Profile creation failed: {e}"));
    }
    crate::hlog!("auth: signed up {}", form.email);
    AuthOutcome::success(identity)
}

/// Sign in and mark the profile online, creating the row from the sign-up
/// metadata if it is missing.
pub fn sign_in(backend: &dyn Backend, form: &SignInForm, now: DateTime<Utc>) -> AuthOutcome {
    let identity = match backend.sign_in(&form.email, &form.password) {
        Ok(identity) => identity,
        Err(e) => return AuthOutcome::failed(e.to_string()),
    };

    let existing = match backend.find_profile_by_email(&form.email) {
        Ok(existing) => existing,
        Err(e) => return AuthOutcome::failed(e.to_string()),
    };
    let written = match existing {
        None => backend.insert_profile(&profile_from_identity(&identity, now)),
        Some(_) => backend
            .update_profile_by_email(&form.email, &ProfileChanges::presence(Status::Online, now)),
    };
    if let Err(e) = written {
        return AuthOutcome::failed(e.to_string());
    }
    crate::hlog!("auth: signed in {}", form.email);
    AuthOutcome::success(identity)
}

fn profile_from_identity(identity: &Identity, now: DateTime<Utc>) -> NewProfile {
    let groups = identity
        .metadata
        .get("groups")
        .and_then(|g| g.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|g| g.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    NewProfile {
        email: identity.email.clone(),
        username: identity.metadata_str("username").unwrap_or_default(),
        phone_number: identity.metadata_str("phoneNumber"),
        avatar_url: identity.metadata_str("avatarUrl"),
        groups,
        last_seen: now,
        status: Status::Online,
    }
}

/// Mark the caller offline (best effort), then end the auth session.
pub fn sign_out(backend: &dyn Backend, now: DateTime<Utc>) -> Result<(), BackendError> {
    if let Ok(Some(identity)) = backend.current_identity() {
        let offline = ProfileChanges::presence(Status::Offline, now);
        if let Err(e) = backend.update_profile_by_email(&identity.email, &offline) {
            crate::hlog!("auth: could not mark {} offline: {}", identity.email, e);
        }
    }
    backend.sign_out()
}

/// The signed-in user's profile row.
pub fn current_profile(backend: &dyn Backend) -> Result<Profile, BackendError> {
    let identity = backend
        .current_identity()?
        .ok_or(BackendError::NotAuthenticated)?;
    backend
        .find_profile_by_email(&identity.email)?
        .ok_or_else(|| BackendError::NotFound(format!("No profile for {}", identity.email)))
}

pub fn update_settings(
    backend: &dyn Backend,
    email: &str,
    form: &SettingsForm,
) -> Result<Profile, BackendError> {
    let changes = ProfileChanges {
        username: Some(form.username.clone()),
        phone_number: form.phone_number.clone(),
        status: form.status.clone().map(Status::from),
        ..ProfileChanges::default()
    };
    backend.update_profile_by_email(email, &changes)?;
    backend
        .find_profile_by_email(email)?
        .ok_or_else(|| BackendError::NotFound(format!("No profile for {email}")))
}

/// Storage key for a new avatar: `avatar-<profile id>-<unix millis>`.
pub fn avatar_key(profile_id: &str, now: DateTime<Utc>) -> String {
    format!("avatar-{profile_id}-{}", now.timestamp_millis())
}

/// Upload an avatar and point the profile at it. Returns the public URL.
pub fn upload_avatar(
    backend: &dyn Backend,
    bucket: &str,
    profile: &Profile,
    content_type: &str,
    bytes: Vec<u8>,
    now: DateTime<Utc>,
) -> Result<String, BackendError> {
    let key = avatar_key(&profile.id, now);
    let url = backend.upload(bucket, &key, content_type, bytes)?;
    let changes = ProfileChanges {
        avatar_url: Some(url.clone()),
        ..ProfileChanges::default()
    };
    backend.update_profile_by_email(&profile.email, &changes)?;
    Ok(url)
}

pub fn request_password_reset(backend: &dyn Backend, email: &str) -> Result<(), BackendError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(BackendError::Auth("Email is required".into()));
    }
    backend.request_password_reset(email)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResetError {
    #[error("Invalid or missing reset token")]
    MissingToken,
    #[error("Passwords do not match")]
    Mismatch,
    #[error("Password must be at least 8 characters long")]
    TooShort,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Set a new password using the token from a recovery link.
pub fn reset_password(backend: &dyn Backend, form: &ResetPasswordForm) -> Result<(), ResetError> {
    let token = form
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ResetError::MissingToken)?;
    if form.password != form.confirm_password {
        return Err(ResetError::Mismatch);
    }
    if form.password.chars().count() < MIN_RESET_PASSWORD_LEN {
        return Err(ResetError::TooShort);
    }
    backend.update_password(token, &form.password)?;
    Ok(())
}
