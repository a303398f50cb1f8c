//! Hosted platform over HTTP: auth (`/auth/v1`), tables (`/rest/v1`),
//! storage (`/storage/v1`) and realtime channels (see [`socket`]).
//!
//! Every request carries the project's `apikey` plus a bearer token: the
//! signed-in user's access token when there is one, the anon key otherwise.

pub mod socket;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::backend::{
    Backend, BackendError, ChannelSink, SignUp, Subscription, SubscriptionSpec,
};
use crate::model::{
    AuthSession, Identity, Message, NewMessage, NewProfile, Profile, ProfileChanges,
};

const REQUEST_TIMEOUT_SECS: u64 = 15;
/// Refresh the access token this long before it expires.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    /// Project URL, e.g. `https://abcd.supabase.co`.
    pub url: String,
    pub anon_key: String,
}

/// Clones share the agent and the signed-in session.
#[derive(Clone)]
pub struct SupabaseBackend {
    config: SupabaseConfig,
    agent: ureq::Agent,
    session: Arc<Mutex<Option<AuthSession>>>,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build();
        Self {
            config,
            agent,
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<AuthSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// The signed-in session, renewed first when it is about to expire. A
    /// failed renewal keeps the old session; the next call then sees 401.
    fn live_session(&self) -> Option<AuthSession> {
        let current = self.session_slot().clone()?;
        let soon = Utc::now() + chrono::Duration::seconds(REFRESH_MARGIN_SECS);
        if !current.is_expired(soon) {
            return Some(current);
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Some(current);
        };
        match self.refresh(&refresh_token) {
            Ok(renewed) => {
                let mut slot = self.session_slot();
                // Signed out or replaced while the refresh was in flight.
                if slot.as_ref().map(|s| &s.access_token) != Some(&current.access_token) {
                    return slot.clone();
                }
                *slot = Some(renewed.clone());
                crate::hlog!("auth: access token refreshed");
                Some(renewed)
            }
            Err(e) => {
                crate::hlog!("auth: token refresh failed: {}", e);
                Some(current)
            }
        }
    }

    fn bearer(&self) -> String {
        self.live_session()
            .map(|s| s.access_token)
            .unwrap_or_else(|| self.config.anon_key.clone())
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        self.request_as(method, path, &self.bearer())
    }

    fn request_as(&self, method: &str, path: &str, token: &str) -> ureq::Request {
        self.agent
            .request(method, &self.endpoint(path))
            .set("apikey", &self.config.anon_key)
            .set("Authorization", &format!("Bearer {token}"))
    }

    fn refresh(&self, refresh_token: &str) -> Result<AuthSession, BackendError> {
        let response = self
            .request_as(
                "POST",
                "/auth/v1/token?grant_type=refresh_token",
                &self.config.anon_key,
            )
            .send_json(serde_json::json!({ "refresh_token": refresh_token }))
            .map_err(auth_error)?;
        decode(response)
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

/// Pick the human-readable message out of an error body.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            ["msg", "message", "error_description", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|m| m.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| format!("HTTP {status}"))
}

fn split_error(err: ureq::Error) -> Result<(u16, String), BackendError> {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            Ok((code, error_message(code, &body)))
        }
        ureq::Error::Transport(t) => Err(BackendError::Transport(t.to_string())),
    }
}

fn auth_error(err: ureq::Error) -> BackendError {
    match split_error(err) {
        Ok((_, message)) => BackendError::Auth(message),
        Err(e) => e,
    }
}

fn api_error(err: ureq::Error) -> BackendError {
    match split_error(err) {
        Ok((401, _)) => BackendError::NotAuthenticated,
        Ok((_, message)) => BackendError::Api(message),
        Err(e) => e,
    }
}

fn decode<T: DeserializeOwned>(response: ureq::Response) -> Result<T, BackendError> {
    response
        .into_json::<T>()
        .map_err(|e| BackendError::Decode(e.to_string()))
}

/// PostgREST path selecting both directions of a conversation, oldest first.
pub(crate) fn conversation_path(a: &str, b: &str) -> String {
    let clause = format!("(and(sender.eq.{a},receiver.eq.{b}),and(sender.eq.{b},receiver.eq.{a}))");
    format!(
        "/rest/v1/messages?select=*&or={}&order=timestamp.asc",
        urlencoding::encode(&clause)
    )
}

pub(crate) fn mark_read_path(reader: &str, counterpart: &str) -> String {
    format!(
        "/rest/v1/messages?sender=eq.{}&receiver=eq.{}&read=eq.false",
        urlencoding::encode(counterpart),
        urlencoding::encode(reader)
    )
}

/// Realtime socket URL for a project URL.
pub(crate) fn realtime_url(base: &str, anon_key: &str) -> String {
    let base = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!(
        "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
        urlencoding::encode(anon_key)
    )
}

// ---------------------------------------------------------------------------
// Backend impl
// ---------------------------------------------------------------------------

impl Backend for SupabaseBackend {
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUp, BackendError> {
        let response = self
            .request_as("POST", "/auth/v1/signup", &self.config.anon_key)
            .send_json(serde_json::json!({
                "email": email,
                "password": password,
                "data": metadata,
            }))
            .map_err(auth_error)?;
        let body: serde_json::Value = decode(response)?;

        // With email confirmation enabled the reply is the bare user; with
        // auto-confirm it is a full session wrapping the user.
        let user = body.get("user").cloned().unwrap_or_else(|| body.clone());
        let registered_before = user
            .get("identities")
            .and_then(|v| v.as_array())
            .map(|ids| ids.is_empty())
            .unwrap_or(false);
        if registered_before {
            return Ok(SignUp::AlreadyRegistered);
        }

        if body.get("access_token").is_some() {
            if let Ok(session) = serde_json::from_value::<AuthSession>(body.clone()) {
                *self.session_slot() = Some(session);
            }
        }
        let identity: Identity =
            serde_json::from_value(user).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(SignUp::Created(identity))
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
        let response = self
            .request_as(
                "POST",
                "/auth/v1/token?grant_type=password",
                &self.config.anon_key,
            )
            .send_json(serde_json::json!({ "email": email, "password": password }))
            .map_err(auth_error)?;
        let session: AuthSession = decode(response)?;
        let identity = session.identity.clone();
        *self.session_slot() = Some(session);
        Ok(identity)
    }

    fn sign_out(&self) -> Result<(), BackendError> {
        let token = match self.session_slot().take() {
            Some(s) => s.access_token,
            None => return Ok(()),
        };
        self.request_as("POST", "/auth/v1/logout", &token)
            .call()
            .map_err(auth_error)?;
        Ok(())
    }

    fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        let token = match self.live_session() {
            Some(s) => s.access_token,
            None => return Ok(None),
        };
        match self.request_as("GET", "/auth/v1/user", &token).call() {
            Ok(response) => decode(response).map(Some),
            Err(err) => match split_error(err)? {
                (401 | 403, _) => Ok(None),
                (_, message) => Err(BackendError::Auth(message)),
            },
        }
    }

    fn request_password_reset(&self, email: &str) -> Result<(), BackendError> {
        self.request_as("POST", "/auth/v1/recover", &self.config.anon_key)
            .send_json(serde_json::json!({ "email": email }))
            .map_err(auth_error)?;
        Ok(())
    }

    fn update_password(&self, access_token: &str, password: &str) -> Result<(), BackendError> {
        self.request_as("PUT", "/auth/v1/user", access_token)
            .send_json(serde_json::json!({ "password": password }))
            .map_err(auth_error)?;
        Ok(())
    }

    fn session(&self) -> Option<AuthSession> {
        self.session_slot().clone()
    }

    fn restore_session(&self, session: AuthSession) -> Result<(), BackendError> {
        let session = if session.is_expired(Utc::now()) {
            match session.refresh_token.as_deref() {
                Some(token) => self.refresh(token)?,
                None => return Err(BackendError::NotAuthenticated),
            }
        } else {
            session
        };
        *self.session_slot() = Some(session);
        Ok(())
    }

    fn list_profiles(&self) -> Result<Vec<Profile>, BackendError> {
        let response = self
            .request("GET", "/rest/v1/user_profiles?select=*")
            .call()
            .map_err(api_error)?;
        decode(response)
    }

    fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>, BackendError> {
        let path = format!(
            "/rest/v1/user_profiles?select=*&email=eq.{}&limit=1",
            urlencoding::encode(email)
        );
        let response = self.request("GET", &path).call().map_err(api_error)?;
        let rows: Vec<Profile> = decode(response)?;
        Ok(rows.into_iter().next())
    }

    fn insert_profile(&self, row: &NewProfile) -> Result<(), BackendError> {
        let body = serde_json::to_value(row).map_err(|e| BackendError::Decode(e.to_string()))?;
        self.request("POST", "/rest/v1/user_profiles")
            .set("Prefer", "return=minimal")
            .send_json(body)
            .map_err(api_error)?;
        Ok(())
    }

    fn update_profile_by_email(
        &self,
        email: &str,
        changes: &ProfileChanges,
    ) -> Result<(), BackendError> {
        if changes.is_empty() {
            return Ok(());
        }
        let path = format!("/rest/v1/user_profiles?email=eq.{}", urlencoding::encode(email));
        let body =
            serde_json::to_value(changes).map_err(|e| BackendError::Decode(e.to_string()))?;
        self.request("PATCH", &path)
            .set("Prefer", "return=minimal")
            .send_json(body)
            .map_err(api_error)?;
        Ok(())
    }

    fn conversation(&self, a: &str, b: &str) -> Result<Vec<Message>, BackendError> {
        let response = self
            .request("GET", &conversation_path(a, b))
            .call()
            .map_err(api_error)?;
        decode(response)
    }

    fn insert_message(&self, row: &NewMessage) -> Result<Message, BackendError> {
        let body = serde_json::to_value(row).map_err(|e| BackendError::Decode(e.to_string()))?;
        let response = self
            .request("POST", "/rest/v1/messages")
            .set("Prefer", "return=representation")
            .send_json(body)
            .map_err(api_error)?;
        let rows: Vec<Message> = decode(response)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("insert returned no row".into()))
    }

    fn mark_read(&self, reader: &str, counterpart: &str) -> Result<(), BackendError> {
        self.request("PATCH", &mark_read_path(reader, counterpart))
            .set("Prefer", "return=minimal")
            .send_json(serde_json::json!({ "read": true }))
            .map_err(api_error)?;
        Ok(())
    }

    fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let object = format!("{}/{}", urlencoding::encode(bucket), urlencoding::encode(key));
        self.request("POST", &format!("/storage/v1/object/{object}"))
            .set("Content-Type", content_type)
            .send_bytes(&bytes)
            .map_err(api_error)?;
        Ok(self.endpoint(&format!("/storage/v1/object/public/{object}")))
    }

    fn subscribe(
        &self,
        spec: SubscriptionSpec,
        sink: ChannelSink,
    ) -> Result<Subscription, BackendError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| BackendError::Transport("realtime needs a running tokio runtime".into()))?;
        let url = realtime_url(&self.config.url, &self.config.anon_key);
        let topic = spec.topic.clone();
        let backend = self.clone();
        let task = runtime.spawn(socket::channel_loop(
            url,
            spec,
            move || backend.bearer(),
            sink,
        ));
        let abort = task.abort_handle();
        Ok(Subscription::new(topic, move || abort.abort()))
    }
}
