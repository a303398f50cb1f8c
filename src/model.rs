//! Row and form types shared by the platform boundary, the controller and
//! the HTTP API.
//!
//! Field names follow the platform's column names (`user_profiles` and
//! `messages` tables), so rows deserialize straight from REST replies and
//! realtime payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Value of the profile `status` column.
///
/// Presence writes `"online"` / `"offline"`; the settings screen may store any
/// free-text status line, which is kept verbatim and counts as not present.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Online,
    #[default]
    Offline,
    Custom(String),
}

impl Status {
    pub fn is_online(&self) -> bool {
        matches!(self, Status::Online)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Online => "online",
            Status::Offline => "offline",
            Status::Custom(text) => text,
        }
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        match value.as_str() {
            "online" => Status::Online,
            "offline" | "" => Status::Offline,
            _ => Status::Custom(value),
        }
    }
}

impl From<&str> for Status {
    fn from(value: &str) -> Self {
        Status::from(value.to_string())
    }
}

impl From<Status> for String {
    fn from(value: Status) -> Self {
        match value {
            Status::Custom(text) => text,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

/// A `user_profiles` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Insert payload for `user_profiles`; the platform assigns `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewProfile {
    pub email: String,
    pub username: String,
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub groups: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub status: Status,
}

/// Partial update for `user_profiles`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ProfileChanges {
    /// Presence change written on sign-in / sign-out.
    pub fn presence(status: Status, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            last_seen: Some(now),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A `messages` row, or a locally synthesized provisional copy of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    /// Correlation token generated by the sending client and stored on the
    /// authoritative row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Message {
    /// Whether the unordered {sender, receiver} pair equals {a, b}.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }
}

/// Insert payload for `messages`; the platform assigns `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub sender: String,
    pub receiver: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub client_ref: Option<String>,
}

impl From<&Message> for NewMessage {
    fn from(m: &Message) -> Self {
        Self {
            sender: m.sender.clone(),
            receiver: m.receiver.clone(),
            text: m.text.clone(),
            timestamp: m.timestamp,
            read: m.read,
            client_ref: m.client_ref.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth records
// ---------------------------------------------------------------------------

/// The platform's authentication record (distinct from the profile row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "user_metadata")]
    pub metadata: serde_json::Value,
}

impl Identity {
    /// String field from the sign-up metadata, if present and non-empty.
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// A signed-in session as issued by the platform's auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(rename = "user")]
    pub identity: Identity,
}

impl AuthSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at <= now.timestamp())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Forms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SignUpForm {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default, alias = "phoneNumber")]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignInForm {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsForm {
    pub username: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResetPasswordForm {
    #[serde(default)]
    pub token: Option<String>,
    pub password: String,
    #[serde(alias = "confirmPassword")]
    pub confirm_password: String,
}
