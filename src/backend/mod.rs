//! Boundary to the hosted platform: authentication, the `user_profiles` and
//! `messages` tables, blob storage, and realtime change channels.
//!
//! [`Backend`] methods block (the HTTP transport is synchronous). Async
//! callers go through [`blocking`], which runs the call on tokio's blocking
//! pool so the event loop never stalls on the network.

pub mod memory;
pub mod supabase;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{
    AuthSession, Identity, Message, NewMessage, NewProfile, Profile, ProfileChanges,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// The auth service rejected the request; carries its message.
    #[error("{0}")]
    Auth(String),
    /// The table or storage API rejected the request; carries its message.
    #[error("{0}")]
    Api(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("User not authenticated")]
    NotAuthenticated,
    #[error("{0}")]
    NotFound(String),
    #[error("background task failed: {0}")]
    Task(String),
}

// ---------------------------------------------------------------------------
// Realtime types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    #[serde(rename = "user_profiles")]
    Profiles,
    #[serde(rename = "messages")]
    Messages,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "user_profiles",
            Table::Messages => "messages",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "user_profiles" => Some(Table::Profiles),
            "messages" => Some(Table::Messages),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            _ => None,
        }
    }
}

/// A row change pushed by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
}

/// One `(table, event, filter)` clause of a channel subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub table: Table,
    pub kind: ChangeKind,
    /// Platform filter syntax: `column=op.value` with `eq`, `neq` or `in`.
    pub filter: Option<String>,
}

impl Binding {
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self.kind == event.kind
            && self
                .filter
                .as_deref()
                .map(|f| filter_matches(f, &event.record))
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub topic: String,
    pub bindings: Vec<Binding>,
}

impl SubscriptionSpec {
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.bindings.iter().any(|b| b.accepts(event))
    }
}

/// What a channel delivers to its subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(ChangeEvent),
    Joined { topic: String },
    Dropped { topic: String, reason: String },
}

pub type ChannelSink = mpsc::UnboundedSender<ChannelMessage>;

/// Live channel handle. Dropping it (or calling [`Subscription::unsubscribe`])
/// releases the channel.
pub struct Subscription {
    topic: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            topic: topic.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("live", &self.release.is_some())
            .finish()
    }
}

/// Evaluate a realtime filter (`column=op.value`) against a row.
///
/// Values compare as text, so `read=eq.false` matches a JSON `false`.
/// Malformed filters match nothing.
pub fn filter_matches(filter: &str, record: &serde_json::Value) -> bool {
    let Some((column, rest)) = filter.split_once('=') else {
        return false;
    };
    let Some((op, operand)) = rest.split_once('.') else {
        return false;
    };
    let actual = match record.get(column) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => return op == "neq",
        Some(other) => other.to_string(),
    };
    match op {
        "eq" => actual == operand,
        "neq" => actual != operand,
        "in" => operand
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .map(|list| list.split(',').any(|v| v.trim() == actual))
            .unwrap_or(false),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SignUp {
    Created(Identity),
    /// The auth service answered without creating an identity for the email.
    AlreadyRegistered,
}

pub trait Backend: Send + Sync {
    // -- auth --
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUp, BackendError>;
    fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError>;
    fn sign_out(&self) -> Result<(), BackendError>;
    fn current_identity(&self) -> Result<Option<Identity>, BackendError>;
    fn request_password_reset(&self, email: &str) -> Result<(), BackendError>;
    fn update_password(&self, access_token: &str, password: &str) -> Result<(), BackendError>;
    fn session(&self) -> Option<AuthSession>;
    fn restore_session(&self, session: AuthSession) -> Result<(), BackendError>;

    // -- user_profiles --
    fn list_profiles(&self) -> Result<Vec<Profile>, BackendError>;
    fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>, BackendError>;
    fn insert_profile(&self, row: &NewProfile) -> Result<(), BackendError>;
    fn update_profile_by_email(
        &self,
        email: &str,
        changes: &ProfileChanges,
    ) -> Result<(), BackendError>;

    // -- messages --
    /// Both directions between `a` and `b`, ascending by timestamp.
    fn conversation(&self, a: &str, b: &str) -> Result<Vec<Message>, BackendError>;
    fn insert_message(&self, row: &NewMessage) -> Result<Message, BackendError>;
    /// Flip `read` on every unread message from `counterpart` to `reader`.
    fn mark_read(&self, reader: &str, counterpart: &str) -> Result<(), BackendError>;

    // -- storage --
    /// Upload a blob and return its public URL.
    fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError>;

    // -- realtime --
    fn subscribe(
        &self,
        spec: SubscriptionSpec,
        sink: ChannelSink,
    ) -> Result<Subscription, BackendError>;
}

/// Run a backend call on the blocking pool.
pub async fn blocking<T, F>(backend: &Arc<dyn Backend>, call: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Backend) -> Result<T, BackendError> + Send + 'static,
{
    let backend = Arc::clone(backend);
    tokio::task::spawn_blocking(move || call(backend.as_ref()))
        .await
        .map_err(|e| BackendError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_eq_and_neq() {
        let row = json!({"sender": "a", "read": false});
        assert!(filter_matches("sender=eq.a", &row));
        assert!(!filter_matches("sender=eq.b", &row));
        assert!(filter_matches("sender=neq.b", &row));
        assert!(filter_matches("read=eq.false", &row));
    }

    #[test]
    fn filter_in_list() {
        let row = json!({"sender": "b"});
        assert!(filter_matches("sender=in.(a,b)", &row));
        assert!(!filter_matches("sender=in.(a,c)", &row));
        assert!(!filter_matches("sender=in.a,b", &row));
    }

    #[test]
    fn malformed_or_unknown_filters_match_nothing() {
        let row = json!({"sender": "a"});
        assert!(!filter_matches("sender", &row));
        assert!(!filter_matches("sender=a", &row));
        assert!(!filter_matches("sender=like.a", &row));
        assert!(!filter_matches("missing=eq.a", &row));
    }

    #[test]
    fn binding_checks_table_kind_and_filter() {
        let binding = Binding {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            filter: Some("receiver=eq.a".to_string()),
        };
        let event = ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            record: json!({"receiver": "a"}),
        };
        assert!(binding.accepts(&event));

        let update = ChangeEvent {
            kind: ChangeKind::Update,
            ..event.clone()
        };
        assert!(!binding.accepts(&update));

        let profiles = ChangeEvent {
            table: Table::Profiles,
            ..event
        };
        assert!(!binding.accepts(&profiles));
    }

    #[test]
    fn subscription_releases_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let sub = Subscription::new("t", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sub.topic(), "t");
        sub.unsubscribe();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&released);
        {
            let _sub = Subscription::new("t", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }
}
