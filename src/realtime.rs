//! Realtime channels the dashboard keeps open: one per selected
//! conversation, plus one for presence changes on the whole roster.

use std::sync::Arc;

use crate::backend::{
    Backend, BackendError, Binding, ChangeEvent, ChangeKind, ChannelSink, Subscription,
    SubscriptionSpec, Table,
};
use crate::conversation::MergeMode;
use crate::model::Message;
use crate::roster::PresenceUpdate;

pub const PRESENCE_TOPIC: &str = "user-status-changes";

/// The unordered pair a conversation channel is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationScope {
    pub caller: String,
    pub counterpart: String,
}

impl ConversationScope {
    pub fn new(caller: impl Into<String>, counterpart: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            counterpart: counterpart.into(),
        }
    }

    pub fn topic(&self) -> String {
        format!("chat-{}-{}", self.caller, self.counterpart)
    }

    /// Platform filters take one column, so the channel narrows on `sender`
    /// and [`covers`](Self::covers) checks the full pair on arrival.
    pub fn spec(&self) -> SubscriptionSpec {
        let filter = format!("sender=in.({},{})", self.caller, self.counterpart);
        let binding = |kind| Binding {
            table: Table::Messages,
            kind,
            filter: Some(filter.clone()),
        };
        SubscriptionSpec {
            topic: self.topic(),
            bindings: vec![binding(ChangeKind::Insert), binding(ChangeKind::Update)],
        }
    }

    pub fn covers(&self, message: &Message) -> bool {
        message.is_between(&self.caller, &self.counterpart)
    }
}

pub fn presence_spec() -> SubscriptionSpec {
    SubscriptionSpec {
        topic: PRESENCE_TOPIC.to_string(),
        bindings: vec![Binding {
            table: Table::Profiles,
            kind: ChangeKind::Update,
            filter: None,
        }],
    }
}

/// Holds at most one conversation channel. Switching scope releases the old
/// channel before the new one is opened.
#[derive(Debug, Default)]
pub struct ConversationBridge {
    active: Option<(ConversationScope, Subscription)>,
}

impl ConversationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> Option<&ConversationScope> {
        self.active.as_ref().map(|(scope, _)| scope)
    }

    /// Make sure a channel for `scope` is live. Returns `true` when a new
    /// channel was opened.
    pub fn ensure(
        &mut self,
        backend: &Arc<dyn Backend>,
        scope: ConversationScope,
        sink: ChannelSink,
    ) -> Result<bool, BackendError> {
        if self.scope() == Some(&scope) {
            return Ok(false);
        }
        self.teardown();
        let subscription = backend.subscribe(scope.spec(), sink)?;
        crate::hlog!("realtime: subscribed {}", subscription.topic());
        self.active = Some((scope, subscription));
        Ok(true)
    }

    pub fn teardown(&mut self) {
        if let Some((scope, subscription)) = self.active.take() {
            crate::hlog!("realtime: released {}", scope.topic());
            subscription.unsubscribe();
        }
    }
}

/// What a change event means to the dashboard.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message { mode: MergeMode, message: Message },
    Presence(PresenceUpdate),
    Ignored,
}

pub fn classify(event: &ChangeEvent) -> Inbound {
    match (event.table, event.kind) {
        (Table::Messages, kind) => match serde_json::from_value::<Message>(event.record.clone()) {
            Ok(message) => Inbound::Message {
                mode: match kind {
                    ChangeKind::Insert => MergeMode::Insert,
                    ChangeKind::Update => MergeMode::Update,
                },
                message,
            },
            Err(_) => Inbound::Ignored,
        },
        (Table::Profiles, ChangeKind::Update) => PresenceUpdate::from_record(&event.record)
            .map(Inbound::Presence)
            .unwrap_or(Inbound::Ignored),
        (Table::Profiles, ChangeKind::Insert) => Inbound::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::ChannelMessage;
    use serde_json::json;

    #[test]
    fn scope_topic_and_filter() {
        let scope = ConversationScope::new("a", "b");
        assert_eq!(scope.topic(), "chat-a-b");
        let spec = scope.spec();
        assert_eq!(spec.bindings.len(), 2);
        assert!(spec
            .bindings
            .iter()
            .all(|b| b.filter.as_deref() == Some("sender=in.(a,b)")));
    }

    #[test]
    fn scope_covers_only_the_pair() {
        let scope = ConversationScope::new("a", "b");
        let mut m: Message = serde_json::from_value(json!({
            "id": "m1", "sender": "b", "receiver": "a", "text": "x",
            "timestamp": "2024-05-01T10:00:00Z",
        }))
        .unwrap();
        assert!(scope.covers(&m));
        // Passes the sender filter but belongs to another conversation.
        m.receiver = "c".into();
        assert!(!scope.covers(&m));
    }

    #[test]
    fn classify_messages_and_presence() {
        let insert = ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Insert,
            record: json!({
                "id": "m1", "sender": "b", "receiver": "a", "text": "x",
                "timestamp": "2024-05-01T10:00:00Z", "read": false,
            }),
        };
        assert!(matches!(
            classify(&insert),
            Inbound::Message {
                mode: MergeMode::Insert,
                ..
            }
        ));

        let presence = ChangeEvent {
            table: Table::Profiles,
            kind: ChangeKind::Update,
            record: json!({"id": "u1", "email": "u@x.com", "status": "online"}),
        };
        assert!(matches!(classify(&presence), Inbound::Presence(p) if p.id == "u1"));

        let garbage = ChangeEvent {
            table: Table::Messages,
            kind: ChangeKind::Update,
            record: json!({"id": 5}),
        };
        assert_eq!(classify(&garbage), Inbound::Ignored);
    }

    #[test]
    fn bridge_switches_scope_and_releases_old_channel() {
        let memory = MemoryBackend::default();
        let backend: Arc<dyn Backend> = Arc::new(memory.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut bridge = ConversationBridge::new();

        assert!(bridge
            .ensure(&backend, ConversationScope::new("a", "b"), tx.clone())
            .unwrap());
        assert!(!bridge
            .ensure(&backend, ConversationScope::new("a", "b"), tx.clone())
            .unwrap());
        assert_eq!(memory.live_channels(), ["chat-a-b"]);

        assert!(bridge
            .ensure(&backend, ConversationScope::new("a", "c"), tx)
            .unwrap());
        assert_eq!(memory.live_channels(), ["chat-a-c"]);

        bridge.teardown();
        assert!(memory.live_channels().is_empty());
        assert!(bridge.scope().is_none());

        let mut joined = Vec::new();
        while let Ok(ChannelMessage::Joined { topic }) = rx.try_recv() {
            joined.push(topic);
        }
        assert_eq!(joined, ["chat-a-b", "chat-a-c"]);
    }
}
