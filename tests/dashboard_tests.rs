//! Controller scenarios against the in-process platform:
//!
//! - mounting loads the caller and roster and opens the presence channel
//! - optimistic sends reconcile to exactly one confirmed message
//! - inbound realtime messages are merged and marked read
//! - presence and roster filters follow platform changes

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use huddle::backend::memory::MemoryBackend;
use huddle::backend::{Backend, BackendError, ChannelSink, SignUp, Subscription, SubscriptionSpec};
use huddle::conversation::Delivery;
use huddle::dashboard::{Controller, DashboardError, DashboardView, SendOutcome};
use huddle::model::{
    AuthSession, Identity, Message, NewMessage, NewProfile, Profile, ProfileChanges, SignInForm,
    Status,
};
use huddle::roster::RosterFilter;
use huddle::session;
use huddle::web_client::sync::change_pump;

struct Fixture {
    memory: MemoryBackend,
    controller: Controller,
    me: Profile,
    alice: Profile,
    bob: Profile,
}

async fn mounted() -> Fixture {
    let memory = MemoryBackend::new();
    let me = memory.seed_user("me@example.com", "secret1", "me");
    let alice = memory.seed_user("alice@example.com", "secret1", "Alice");
    let bob = memory.seed_user("bob@example.com", "secret1", "Bob");

    let outcome = session::sign_in(
        &memory,
        &SignInForm {
            email: "me@example.com".into(),
            password: "secret1".into(),
        },
        Utc::now(),
    );
    assert!(outcome.is_success(), "{}", outcome.status);

    let backend: Arc<dyn Backend> = Arc::new(memory.clone());
    let (controller, inbound) = Controller::new(backend, 64);
    tokio::spawn(change_pump(controller.clone(), inbound));
    controller.mount().await.expect("mount");

    Fixture {
        memory,
        controller,
        me,
        alice,
        bob,
    }
}

fn message(sender: &Profile, receiver: &Profile, text: &str, secs: i64) -> NewMessage {
    NewMessage {
        sender: sender.id.clone(),
        receiver: receiver.id.clone(),
        text: text.to_string(),
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        read: false,
        client_ref: None,
    }
}

/// Poll the dashboard until `check` holds, or fail after two seconds.
async fn eventually(controller: &Controller, what: &str, check: impl Fn(&DashboardView) -> bool) {
    for _ in 0..200 {
        if check(&controller.snapshot().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn mount_loads_caller_roster_and_presence_channel() {
    let f = mounted().await;
    let view = f.controller.snapshot().await;

    let caller = view.caller.expect("caller");
    assert_eq!(caller.id, f.me.id);
    assert!(caller.status.is_online());
    assert_eq!(view.total_users, 2);
    assert!(view.users.iter().all(|u| u.id != f.me.id));
    assert!(!view.loading);
    assert!(f
        .memory
        .live_channels()
        .contains(&"user-status-changes".to_string()));
}

#[tokio::test]
async fn select_loads_history_and_marks_inbound_read() {
    let f = mounted().await;
    f.memory.deliver(&message(&f.alice, &f.me, "second", 20));
    f.memory.deliver(&message(&f.me, &f.alice, "first", 10));
    f.memory.deliver(&message(&f.bob, &f.me, "elsewhere", 15));

    f.controller.select(&f.alice.id).await.unwrap();
    let view = f.controller.snapshot().await;

    let texts: Vec<_> = view
        .messages
        .entries()
        .iter()
        .map(|e| e.message.text.as_str())
        .collect();
    assert_eq!(texts, ["first", "second"]);
    assert_eq!(view.selected.map(|p| p.id), Some(f.alice.id.clone()));
    assert!(!view.messages_loading);

    let stored = f.memory.messages();
    let from_alice = stored.iter().find(|m| m.sender == f.alice.id).unwrap();
    assert!(from_alice.read);
    let from_bob = stored.iter().find(|m| m.sender == f.bob.id).unwrap();
    assert!(!from_bob.read, "other conversations stay unread");
    assert!(view.messages.entries()[1].message.read);
}

#[tokio::test]
async fn send_reconciles_to_one_confirmed_message() {
    let f = mounted().await;
    let mut events = f.controller.subscribe_events();
    f.controller.select(&f.alice.id).await.unwrap();

    let pending = f.controller.send("hello alice").await.unwrap();
    assert!(pending.provisional.id.starts_with("temp-"));

    let outcome = pending.completion.await.unwrap();
    let stored = match outcome {
        SendOutcome::Delivered(m) => m,
        other => panic!("expected delivery, got {other:?}"),
    };
    assert_eq!(stored.client_ref, pending.provisional.client_ref);

    // Let the realtime echo land too; it must not add a second copy.
    eventually(&f.controller, "echo processed", |v| {
        v.messages.len() == 1 && v.messages.entries()[0].delivery == Delivery::Confirmed
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = f.controller.snapshot().await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages.entries()[0].message.id, stored.id);
    assert_eq!(f.memory.messages().len(), 1);

    let mut saw_pending = false;
    let mut saw_confirmed = false;
    while let Ok(event) = events.try_recv() {
        let json = serde_json::to_value(&event).unwrap();
        match json["type"].as_str() {
            Some("message_appended") if json["pending"] == true => saw_pending = true,
            Some("message_confirmed") => saw_confirmed = true,
            _ => {}
        }
    }
    assert!(saw_pending && saw_confirmed);
}

#[tokio::test]
async fn failed_send_removes_provisional_and_records_error() {
    let f = mounted().await;
    f.controller.select(&f.alice.id).await.unwrap();
    f.memory.fail_next_message_insert("permission denied for table messages");

    let pending = f.controller.send("will fail").await.unwrap();
    assert!(matches!(
        pending.completion.await.unwrap(),
        SendOutcome::Failed(reason) if reason.contains("permission denied")
    ));

    let view = f.controller.snapshot().await;
    assert!(view.messages.is_empty());
    assert!(view
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("permission denied"));
    assert!(f.memory.messages().is_empty());
}

#[tokio::test]
async fn send_validates_text_and_selection() {
    let f = mounted().await;
    assert_eq!(
        f.controller.send("hi").await.unwrap_err(),
        DashboardError::NoConversation
    );
    f.controller.select(&f.alice.id).await.unwrap();
    assert_eq!(
        f.controller.send("   ").await.unwrap_err(),
        DashboardError::EmptyMessage
    );
    assert!(matches!(
        f.controller.select("nobody").await,
        Err(DashboardError::UnknownUser(_))
    ));
}

#[tokio::test]
async fn inbound_realtime_message_is_merged_and_marked_read() {
    let f = mounted().await;
    f.controller.select(&f.alice.id).await.unwrap();

    let delivered = f.memory.deliver(&message(&f.alice, &f.me, "ping", 5));
    eventually(&f.controller, "inbound message merged", |v| {
        v.messages.contains(&delivered.id)
    })
    .await;
    eventually(&f.controller, "inbound message read", |v| {
        v.messages.entries().iter().all(|e| e.message.read)
    })
    .await;
    assert!(f.memory.messages().iter().all(|m| m.read));

    // Same sender filter, different conversation: not shown.
    let stray = f.memory.deliver(&message(&f.alice, &f.bob, "not for me", 6));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!f.controller.snapshot().await.messages.contains(&stray.id));
}

#[tokio::test]
async fn switching_conversation_releases_previous_channel() {
    let f = mounted().await;
    f.controller.select(&f.alice.id).await.unwrap();
    let alice_topic = format!("chat-{}-{}", f.me.id, f.alice.id);
    assert!(f.memory.live_channels().contains(&alice_topic));

    f.controller.select(&f.bob.id).await.unwrap();
    let channels = f.memory.live_channels();
    assert!(!channels.contains(&alice_topic));
    assert!(channels.contains(&format!("chat-{}-{}", f.me.id, f.bob.id)));

    // A message in the old conversation no longer reaches the timeline.
    let old = f.memory.deliver(&message(&f.alice, &f.me, "late", 1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!f.controller.snapshot().await.messages.contains(&old.id));

    f.controller.unmount().await;
    assert!(f.memory.live_channels().is_empty());
    assert!(f.controller.snapshot().await.caller.is_none());
}

#[tokio::test]
async fn presence_updates_follow_the_roster() {
    let f = mounted().await;
    f.memory
        .update_profile_by_email(
            &f.alice.email,
            &ProfileChanges::presence(Status::Online, Utc::now()),
        )
        .unwrap();

    eventually(&f.controller, "alice online", |v| {
        v.users
            .iter()
            .any(|u| u.id == f.alice.id && u.status.is_online())
    })
    .await;

    let online = f
        .controller
        .set_filter(RosterFilter {
            online_only: true,
            ..RosterFilter::default()
        })
        .await;
    let ids: Vec<_> = online.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, [f.alice.id.as_str()]);
}

#[tokio::test]
async fn has_messages_filter_uses_conversation_fan_out() {
    let f = mounted().await;
    f.memory.deliver(&message(&f.bob, &f.me, "hey", 1));

    let visible = f
        .controller
        .set_filter(RosterFilter {
            has_messages: true,
            ..RosterFilter::default()
        })
        .await;
    let ids: Vec<_> = visible.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, [f.bob.id.as_str()]);

    // Combined with search, both criteria apply.
    let none = f
        .controller
        .set_filter(RosterFilter {
            search: "ali".into(),
            has_messages: true,
            ..RosterFilter::default()
        })
        .await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn mount_without_session_reports_not_authenticated() {
    let memory = MemoryBackend::new();
    let backend: Arc<dyn Backend> = Arc::new(memory);
    let (controller, _inbound) = Controller::new(backend, 8);

    let err = controller.mount().await.unwrap_err();
    assert_eq!(err.to_string(), "User not authenticated");
    let view = controller.snapshot().await;
    assert_eq!(view.error.as_deref(), Some("User not authenticated"));
    assert!(!view.loading);
}

/// The in-process platform, except that a conversation fetch answers with a
/// snapshot taken before it sleeps.
struct SlowHistory {
    inner: MemoryBackend,
    delay: Duration,
}

impl Backend for SlowHistory {
    fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: serde_json::Value,
    ) -> Result<SignUp, BackendError> {
        self.inner.sign_up(email, password, metadata)
    }
    fn sign_in(&self, email: &str, password: &str) -> Result<Identity, BackendError> {
        self.inner.sign_in(email, password)
    }
    fn sign_out(&self) -> Result<(), BackendError> {
        self.inner.sign_out()
    }
    fn current_identity(&self) -> Result<Option<Identity>, BackendError> {
        self.inner.current_identity()
    }
    fn request_password_reset(&self, email: &str) -> Result<(), BackendError> {
        self.inner.request_password_reset(email)
    }
    fn update_password(&self, access_token: &str, password: &str) -> Result<(), BackendError> {
        self.inner.update_password(access_token, password)
    }
    fn session(&self) -> Option<AuthSession> {
        self.inner.session()
    }
    fn restore_session(&self, session: AuthSession) -> Result<(), BackendError> {
        self.inner.restore_session(session)
    }
    fn list_profiles(&self) -> Result<Vec<Profile>, BackendError> {
        self.inner.list_profiles()
    }
    fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>, BackendError> {
        self.inner.find_profile_by_email(email)
    }
    fn insert_profile(&self, row: &NewProfile) -> Result<(), BackendError> {
        self.inner.insert_profile(row)
    }
    fn update_profile_by_email(
        &self,
        email: &str,
        changes: &ProfileChanges,
    ) -> Result<(), BackendError> {
        self.inner.update_profile_by_email(email, changes)
    }
    fn conversation(&self, a: &str, b: &str) -> Result<Vec<Message>, BackendError> {
        let snapshot = self.inner.conversation(a, b);
        std::thread::sleep(self.delay);
        snapshot
    }
    fn insert_message(&self, row: &NewMessage) -> Result<Message, BackendError> {
        self.inner.insert_message(row)
    }
    fn mark_read(&self, reader: &str, counterpart: &str) -> Result<(), BackendError> {
        self.inner.mark_read(reader, counterpart)
    }
    fn upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        self.inner.upload(bucket, key, content_type, bytes)
    }
    fn subscribe(
        &self,
        spec: SubscriptionSpec,
        sink: ChannelSink,
    ) -> Result<Subscription, BackendError> {
        self.inner.subscribe(spec, sink)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_during_history_load_survives_the_stale_snapshot() {
    let memory = MemoryBackend::new();
    memory.seed_user("me@example.com", "secret1", "me");
    let alice = memory.seed_user("alice@example.com", "secret1", "Alice");
    memory.sign_in("me@example.com", "secret1").unwrap();

    let backend: Arc<dyn Backend> = Arc::new(SlowHistory {
        inner: memory.clone(),
        delay: Duration::from_millis(300),
    });
    let (controller, inbound) = Controller::new(backend, 64);
    tokio::spawn(change_pump(controller.clone(), inbound));
    controller.mount().await.expect("mount");

    let selecting = tokio::spawn({
        let controller = controller.clone();
        let alice_id = alice.id.clone();
        async move { controller.select(&alice_id).await }
    });
    // The history snapshot is taken; the reply is still on its way.
    eventually(&controller, "conversation selected", |v| v.messages_loading).await;

    let pending = controller.send("hi").await.unwrap();
    let stored = match pending.completion.await.unwrap() {
        SendOutcome::Delivered(m) => m,
        other => panic!("expected delivery, got {other:?}"),
    };
    selecting.await.unwrap().unwrap();

    let view = controller.snapshot().await;
    assert!(!view.messages_loading);
    assert_eq!(memory.messages().len(), 1);
    assert_eq!(view.messages.len(), 1);
    assert!(view.messages.contains(&stored.id));
    assert_eq!(view.messages.pending_count(), 0);

    // A reload that starts after the send sees the row itself.
    controller.refresh().await.unwrap();
    let view = controller.snapshot().await;
    assert_eq!(view.messages.len(), 1);
    assert!(view.messages.contains(&stored.id));
}
