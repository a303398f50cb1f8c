//! In-process stand-in for the hosted platform.
//!
//! Keeps auth users, the signed-in session, both tables, blobs and live
//! channel subscriptions in memory. Every write fans out to matching
//! subscriptions *before* the write returns, which reproduces the
//! "notification arrives before the write reply" ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;

use crate::backend::{
    Backend, BackendError, ChangeEvent, ChangeKind, ChannelMessage, ChannelSink, SignUp,
    Subscription, SubscriptionSpec, Table,
};
use crate::model::{
    AuthSession, Identity, Message, NewMessage, NewProfile, Profile, ProfileChanges,
};

const PUBLIC_STORAGE_BASE: &str = "memory://storage";
const SESSION_TTL_SECS: i64 = 3600;

struct AuthUser {
    password: String,
    identity: Identity,
}

struct Blob {
    content_type: String,
    bytes: Vec<u8>,
}

struct Channel {
    id: u64,
    spec: SubscriptionSpec,
    sink: ChannelSink,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, AuthUser>,
    session: Option<AuthSession>,
    profiles: Vec<Profile>,
    messages: Vec<Message>,
    blobs: HashMap<(String, String), Blob>,
    channels: Vec<Channel>,
    next_channel_id: u64,
    fail_next_message_insert: Option<String>,
    reset_requests: Vec<String>,
}

impl Inner {
    fn publish(&mut self, table: Table, kind: ChangeKind, record: serde_json::Value) {
        let event = ChangeEvent {
            table,
            kind,
            record,
        };
        self.channels.retain(|ch| {
            if !ch.spec.accepts(&event) {
                return !ch.sink.is_closed();
            }
            ch.sink.send(ChannelMessage::Change(event.clone())).is_ok()
        });
    }
}

/// Thread-safe in-memory platform. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `insert_message` fail with `message`.
    pub fn fail_next_message_insert(&self, message: impl Into<String>) {
        self.lock().fail_next_message_insert = Some(message.into());
    }

    /// Insert a message as if another client wrote it.
    pub fn deliver(&self, row: &NewMessage) -> Message {
        insert_message_locked(&mut self.lock(), row)
    }

    /// Every stored message, in insertion order.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.lock().profiles.clone()
    }

    /// Stored blob as `(content_type, bytes)`.
    pub fn blob(&self, bucket: &str, key: &str) -> Option<(String, Vec<u8>)> {
        self.lock()
            .blobs
            .get(&(bucket.to_string(), key.to_string()))
            .map(|b| (b.content_type.clone(), b.bytes.clone()))
    }

    /// Emails for which a password reset was requested.
    pub fn reset_requests(&self) -> Vec<String> {
        self.lock().reset_requests.clone()
    }

    pub fn live_channels(&self) -> Vec<String> {
        self.lock()
            .channels
            .iter()
            .map(|c| c.spec.topic.clone())
            .collect()
    }

    /// Register an auth user and profile row directly, bypassing sign-up.
    pub fn seed_user(&self, email: &str, password: &str, username: &str) -> Profile {
        let mut inner = self.lock();
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_string(),
            metadata: serde_json::json!({ "username": username }),
        };
        inner.users.insert(
            email.to_string(),
            AuthUser {
                password: password.to_string(),
                identity,
            },
        );
        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_string(),
            username: username.to_string(),
            phone_number: None,
            status: Default::default(),
            avatar_url: None,
            last_seen: Some(Utc::now()),
            created_at: Some(Utc::now()),
            groups: Vec::new(),
        };
        inner.profiles.push(profile.clone());
        profile
    }
}

fn to_record<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn insert_message_locked(inner: &mut Inner, row: &NewMessage) -> Message {
    let message = Message {
        id: uuid::Uuid::new_v4().to_string(),
        sender: row.sender.clone(),
        receiver: row.receiver.clone(),
        text: row.text.clone(),
        timestamp: row.timestamp,
        read: row.read,
        client_ref: row.client_ref.clone(),
    };
    inner.messages.push(message.clone());
    let record = to_record(&message);
    inner.publish(Table::Messages, ChangeKind::Insert, record);
    message
}

impl Backend for MemoryBackend {
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUp, BackendError> {
        if email.trim().is_empty() || !email.contains('@') {
            return Err(BackendError::Auth(
                "Unable to validate email address: invalid format".into(),
            ));
        }
        if password.len() < 6 {
            return Err(BackendError::Auth("Password should be at least 6 characters.".into()));
        }
        let mut inner = self.lock();
        if inner.users.contains_key(email) {
            return Ok(SignUp::AlreadyRegistered);
        }
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_string(),
            metadata,
        };
        inner.users.insert(
            email.to_string(),
            AuthUser {
                password: password.to_string(),
                identity: identity.clone(),
            },
        );
        Ok(SignUp::Created(identity))
    }

    fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
        let mut inner = self.lock();
        let identity = match inner.users.get(email) {
            Some(user) if user.password == password => user.identity.clone(),
            _ => return Err(BackendError::Auth("Invalid login credentials".into())),
        };
        inner.session = Some(AuthSession {
            access_token: uuid::Uuid::new_v4().to_string(),
            refresh_token: Some(uuid::Uuid::new_v4().to_string()),
            expires_at: Some(Utc::now().timestamp() + SESSION_TTL_SECS),
            identity: identity.clone(),
        });
        Ok(identity)
    }

    fn sign_out(&self) -> Result<(), BackendError> {
        self.lock().session = None;
        Ok(())
    }

    fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        Ok(self.lock().session.as_ref().map(|s| s.identity.clone()))
    }

    fn request_password_reset(&self, email: &str) -> Result<(), BackendError> {
        // Unknown addresses are accepted silently, like the hosted service.
        self.lock().reset_requests.push(email.to_string());
        Ok(())
    }

    fn update_password(&self, access_token: &str, password: &str) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let email = match &inner.session {
            Some(s) if s.access_token == access_token => s.identity.email.clone(),
            _ => return Err(BackendError::NotAuthenticated),
        };
        match inner.users.get_mut(&email) {
            Some(user) => {
                user.password = password.to_string();
                Ok(())
            }
            None => Err(BackendError::NotFound("User not found".into())),
        }
    }

    fn session(&self) -> Option<AuthSession> {
        self.lock().session.clone()
    }

    fn restore_session(&self, session: AuthSession) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if !inner.users.contains_key(&session.identity.email) {
            return Err(BackendError::NotAuthenticated);
        }
        inner.session = Some(session);
        Ok(())
    }

    fn list_profiles(&self) -> Result<Vec<Profile>, BackendError> {
        Ok(self.lock().profiles.clone())
    }

    fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>, BackendError> {
        Ok(self
            .lock()
            .profiles
            .iter()
            .find(|p| p.email == email)
            .cloned())
    }

    fn insert_profile(&self, row: &NewProfile) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let profile = Profile {
            id: uuid::Uuid::new_v4().to_string(),
            email: row.email.clone(),
            username: row.username.clone(),
            phone_number: row.phone_number.clone(),
            status: row.status.clone(),
            avatar_url: row.avatar_url.clone(),
            last_seen: Some(row.last_seen),
            created_at: Some(Utc::now()),
            groups: row.groups.clone(),
        };
        inner.profiles.push(profile.clone());
        let record = to_record(&profile);
        inner.publish(Table::Profiles, ChangeKind::Insert, record);
        Ok(())
    }

    fn update_profile_by_email(
        &self,
        email: &str,
        changes: &ProfileChanges,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let mut updated = Vec::new();
        for profile in inner.profiles.iter_mut().filter(|p| p.email == email) {
            if let Some(username) = &changes.username {
                profile.username = username.clone();
            }
            if let Some(phone) = &changes.phone_number {
                profile.phone_number = Some(phone.clone());
            }
            if let Some(status) = &changes.status {
                profile.status = status.clone();
            }
            if let Some(url) = &changes.avatar_url {
                profile.avatar_url = Some(url.clone());
            }
            if let Some(seen) = changes.last_seen {
                profile.last_seen = Some(seen);
            }
            updated.push(to_record(profile));
        }
        for record in updated {
            inner.publish(Table::Profiles, ChangeKind::Update, record);
        }
        Ok(())
    }

    fn conversation(&self, a: &str, b: &str) -> Result<Vec<Message>, BackendError> {
        let mut history: Vec<Message> = self
            .lock()
            .messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect();
        history.sort_by_key(|m| m.timestamp);
        Ok(history)
    }

    fn insert_message(&self, row: &NewMessage) -> Result<Message, BackendError> {
        let mut inner = self.lock();
        if let Some(message) = inner.fail_next_message_insert.take() {
            return Err(BackendError::Api(message));
        }
        Ok(insert_message_locked(&mut inner, row))
    }

    fn mark_read(&self, reader: &str, counterpart: &str) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let mut updated = Vec::new();
        for message in inner
            .messages
            .iter_mut()
            .filter(|m| m.sender == counterpart && m.receiver == reader && !m.read)
        {
            message.read = true;
            updated.push(to_record(message));
        }
        for record in updated {
            inner.publish(Table::Messages, ChangeKind::Update, record);
        }
        Ok(())
    }

    fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let mut inner = self.lock();
        let slot = (bucket.to_string(), key.to_string());
        if inner.blobs.contains_key(&slot) {
            return Err(BackendError::Api("The resource already exists".into()));
        }
        inner.blobs.insert(
            slot,
            Blob {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        Ok(format!("{PUBLIC_STORAGE_BASE}/object/public/{bucket}/{key}"))
    }

    fn subscribe(
        &self,
        spec: SubscriptionSpec,
        sink: ChannelSink,
    ) -> Result<Subscription, BackendError> {
        let topic = spec.topic.clone();
        let id = {
            let mut inner = self.lock();
            let id = inner.next_channel_id;
            inner.next_channel_id += 1;
            inner.channels.push(Channel {
                id,
                spec,
                sink: sink.clone(),
            });
            id
        };
        let _ = sink.send(ChannelMessage::Joined {
            topic: topic.clone(),
        });

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(topic, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.channels.retain(|c| c.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Binding;
    use crate::model::Status;
    use tokio::sync::mpsc;

    fn new_message(sender: &str, receiver: &str, text: &str) -> NewMessage {
        NewMessage {
            sender: sender.into(),
            receiver: receiver.into(),
            text: text.into(),
            timestamp: Utc::now(),
            read: false,
            client_ref: None,
        }
    }

    #[test]
    fn duplicate_sign_up_reports_already_registered() {
        let backend = MemoryBackend::new();
        let first = backend
            .sign_up("a@x.com", "secret123", serde_json::json!({}))
            .unwrap();
        assert!(matches!(first, SignUp::Created(_)));
        let second = backend
            .sign_up("a@x.com", "other-pass", serde_json::json!({}))
            .unwrap();
        assert_eq!(second, SignUp::AlreadyRegistered);
    }

    #[test]
    fn sign_in_checks_password_and_opens_session() {
        let backend = MemoryBackend::new();
        backend.seed_user("a@x.com", "secret123", "alice");
        let err = backend.sign_in("a@x.com", "wrong").unwrap_err();
        assert_eq!(err.to_string(), "Invalid login credentials");
        assert!(backend.current_identity().unwrap().is_none());

        backend.sign_in("a@x.com", "secret123").unwrap();
        assert_eq!(
            backend.current_identity().unwrap().map(|i| i.email),
            Some("a@x.com".to_string())
        );
        backend.sign_out().unwrap();
        assert!(backend.session().is_none());
    }

    #[test]
    fn conversation_returns_both_directions_in_time_order() {
        let backend = MemoryBackend::new();
        let mut late = new_message("a", "b", "second");
        late.timestamp = Utc::now() + chrono::Duration::seconds(5);
        backend.deliver(&late);
        backend.deliver(&new_message("b", "a", "first"));
        backend.deliver(&new_message("a", "c", "elsewhere"));

        let history = backend.conversation("a", "b").unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn mark_read_only_touches_inbound_unread() {
        let backend = MemoryBackend::new();
        backend.deliver(&new_message("b", "a", "to a"));
        backend.deliver(&new_message("a", "b", "to b"));
        backend.mark_read("a", "b").unwrap();

        for m in backend.messages() {
            assert_eq!(m.read, m.receiver == "a", "{}", m.text);
        }
        // Idempotent.
        backend.mark_read("a", "b").unwrap();
        assert_eq!(backend.messages().iter().filter(|m| m.read).count(), 1);
    }

    #[test]
    fn writes_fan_out_to_matching_channels_until_released() {
        let backend = MemoryBackend::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = backend
            .subscribe(
                SubscriptionSpec {
                    topic: "chat".into(),
                    bindings: vec![Binding {
                        table: Table::Messages,
                        kind: ChangeKind::Insert,
                        filter: Some("sender=in.(a,b)".into()),
                    }],
                },
                tx,
            )
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            ChannelMessage::Joined {
                topic: "chat".into()
            }
        );
        backend.deliver(&new_message("c", "a", "filtered out"));
        backend.deliver(&new_message("b", "a", "hello"));
        match rx.try_recv().unwrap() {
            ChannelMessage::Change(ev) => assert_eq!(ev.record["text"], "hello"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        sub.unsubscribe();
        assert!(backend.live_channels().is_empty());
        backend.deliver(&new_message("b", "a", "after release"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn profile_updates_publish_full_rows() {
        let backend = MemoryBackend::new();
        backend.seed_user("a@x.com", "secret123", "alice");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = backend
            .subscribe(
                SubscriptionSpec {
                    topic: "presence".into(),
                    bindings: vec![Binding {
                        table: Table::Profiles,
                        kind: ChangeKind::Update,
                        filter: None,
                    }],
                },
                tx,
            )
            .unwrap();
        let _ = rx.try_recv();

        backend
            .update_profile_by_email(
                "a@x.com",
                &ProfileChanges::presence(Status::Online, Utc::now()),
            )
            .unwrap();
        match rx.try_recv().unwrap() {
            ChannelMessage::Change(ev) => {
                assert_eq!(ev.record["status"], "online");
                assert_eq!(ev.record["username"], "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn injected_insert_failure_is_one_shot() {
        let backend = MemoryBackend::new();
        backend.fail_next_message_insert("permission denied");
        let err = backend
            .insert_message(&new_message("a", "b", "x"))
            .unwrap_err();
        assert_eq!(err, BackendError::Api("permission denied".into()));
        assert!(backend.insert_message(&new_message("a", "b", "x")).is_ok());
    }

    #[test]
    fn upload_returns_public_url_and_rejects_overwrite() {
        let backend = MemoryBackend::new();
        let url = backend
            .upload("avatars", "avatar-1", "image/png", vec![1, 2, 3])
            .unwrap();
        assert_eq!(url, "memory://storage/object/public/avatars/avatar-1");
        assert_eq!(
            backend.blob("avatars", "avatar-1"),
            Some(("image/png".to_string(), vec![1, 2, 3]))
        );
        assert!(backend
            .upload("avatars", "avatar-1", "image/png", vec![])
            .is_err());
    }
}
