//! The mounted chat dashboard: roster, selected conversation, and the two
//! realtime channels feeding them.
//!
//! [`Controller`] owns the state behind a tokio mutex and is cheap to clone.
//! The lock is never held across a platform call: each operation snapshots
//! what it needs, releases the lock, awaits the platform, then re-locks and
//! checks the conversation is still the one it started for before applying
//! the reply. Every visible change is published as a [`DashboardEvent`].

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::backend::{self, Backend, BackendError, ChannelMessage, ChannelSink, Subscription};
use crate::conversation::{MergeMode, MergeOutcome, Timeline};
use crate::logging;
use crate::model::{Message, NewMessage, Profile, Status};
use crate::realtime::{self, ConversationBridge, ConversationScope, Inbound, PRESENCE_TOPIC};
use crate::roster::{self, PresenceUpdate, RosterFilter};
use crate::session;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DashboardError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Not signed in")]
    NotSignedIn,
    #[error("No conversation selected")]
    NoConversation,
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("Message is empty")]
    EmptyMessage,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Pushed to every connected browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    MessageAppended {
        message: Message,
        pending: bool,
    },
    MessageConfirmed {
        client_ref: String,
        message: Message,
    },
    MessageRemoved {
        id: String,
        client_ref: Option<String>,
        reason: String,
    },
    MessageUpdated {
        message: Message,
    },
    TimelineReloaded {
        counterpart: String,
        count: usize,
    },
    MessagesRead {
        sender: String,
        receiver: String,
        count: usize,
    },
    PresenceChanged {
        id: String,
        status: Status,
        last_seen: Option<DateTime<Utc>>,
    },
    RosterChanged {
        total: usize,
        visible: usize,
    },
    RealtimeStatus {
        topic: String,
        connected: bool,
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Dashboard {
    caller: Option<Profile>,
    /// Every profile except the caller, in platform order.
    users: Vec<Profile>,
    filter: RosterFilter,
    /// Counterparts known to share messages with the caller; `None` until
    /// the fan-out has run.
    with_messages: Option<HashSet<String>>,
    selected: Option<String>,
    timeline: Timeline,
    error: Option<String>,
    loading: bool,
    messages_loading: bool,
    load_generation: u64,
    joined: BTreeSet<String>,
    bridge: ConversationBridge,
    presence: Option<Subscription>,
}

impl Dashboard {
    fn scope(&self) -> Option<ConversationScope> {
        let caller = self.caller.as_ref()?;
        let counterpart = self.selected.as_ref()?;
        Some(ConversationScope::new(caller.id.clone(), counterpart.clone()))
    }

    fn visible_users(&self) -> Vec<Profile> {
        roster::filter_roster(&self.users, &self.filter, self.with_messages.as_ref())
    }

    fn roster_changed(&self) -> DashboardEvent {
        DashboardEvent::RosterChanged {
            total: self.users.len(),
            visible: self.visible_users().len(),
        }
    }

    fn is_tracked_topic(&self, topic: &str) -> bool {
        topic == PRESENCE_TOPIC
            || self
                .bridge
                .scope()
                .map(|s| s.topic() == topic)
                .unwrap_or(false)
    }
}

/// Read-only copy of the dashboard for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub caller: Option<Profile>,
    /// Roster after the active filter.
    pub users: Vec<Profile>,
    pub total_users: usize,
    pub filter: RosterFilter,
    pub selected: Option<Profile>,
    pub messages: Timeline,
    pub error: Option<String>,
    pub loading: bool,
    pub messages_loading: bool,
    pub realtime: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered(Message),
    Failed(String),
}

/// A send in flight: the provisional message already shown, and the task
/// that finishes the write.
#[derive(Debug)]
pub struct PendingSend {
    pub provisional: Message,
    pub completion: JoinHandle<SendOutcome>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Controller {
    backend: Arc<dyn Backend>,
    state: Arc<Mutex<Dashboard>>,
    events: broadcast::Sender<DashboardEvent>,
    changes: ChannelSink,
}

impl Controller {
    /// Returns the controller and the receiving end of its realtime sink;
    /// feed every item from the receiver into [`Controller::handle`].
    pub fn new(
        backend: Arc<dyn Backend>,
        event_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (events, _) = broadcast::channel(event_capacity);
        let (changes, inbound) = mpsc::unbounded_channel();
        let controller = Self {
            backend,
            state: Arc::new(Mutex::new(Dashboard::default())),
            events,
            changes,
        };
        (controller, inbound)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DashboardEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DashboardEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn record_error(&self, st: &mut Dashboard, message: String) {
        crate::hlog!("dashboard: {}", message);
        st.error = Some(message.clone());
        self.emit(DashboardEvent::Error { message });
    }

    pub async fn is_mounted(&self) -> bool {
        self.state.lock().await.caller.is_some()
    }

    pub async fn caller(&self) -> Option<Profile> {
        self.state.lock().await.caller.clone()
    }

    /// Load the signed-in user, open the presence channel, and load the
    /// roster.
    pub async fn mount(&self) -> Result<(), DashboardError> {
        {
            let mut st = self.state.lock().await;
            st.loading = true;
            st.error = None;
        }

        let caller = backend::blocking(&self.backend, |b| session::current_profile(b)).await;
        let caller = {
            let mut st = self.state.lock().await;
            match caller {
                Ok(profile) => {
                    st.caller = Some(profile.clone());
                    profile
                }
                Err(e) => {
                    st.loading = false;
                    self.record_error(&mut st, e.to_string());
                    return Err(e.into());
                }
            }
        };
        crate::hlog!("dashboard: mounted for {}", logging::user_id(&caller.id));

        {
            let mut st = self.state.lock().await;
            if st.presence.is_none() {
                match self
                    .backend
                    .subscribe(realtime::presence_spec(), self.changes.clone())
                {
                    Ok(sub) => st.presence = Some(sub),
                    Err(e) => self.record_error(&mut st, e.to_string()),
                }
            }
        }

        self.refresh_roster().await
    }

    /// Release both channels and forget all state.
    pub async fn unmount(&self) {
        let mut st = self.state.lock().await;
        st.bridge.teardown();
        if let Some(presence) = st.presence.take() {
            presence.unsubscribe();
        }
        *st = Dashboard::default();
        crate::hlog!("dashboard: unmounted");
    }

    pub async fn refresh_roster(&self) -> Result<(), DashboardError> {
        let caller_id = {
            let mut st = self.state.lock().await;
            st.loading = true;
            st.caller.as_ref().map(|c| c.id.clone())
        };

        let listed = backend::blocking(&self.backend, |b| b.list_profiles()).await;
        let fan_out = {
            let mut st = self.state.lock().await;
            st.loading = false;
            let all = match listed {
                Ok(all) => all,
                Err(e) => {
                    self.record_error(&mut st, e.to_string());
                    return Err(e.into());
                }
            };
            if let Some(id) = caller_id.as_deref() {
                if let Some(me) = all.iter().find(|p| p.id == id) {
                    st.caller = Some(me.clone());
                }
            }
            st.users = roster::exclude_caller(all, caller_id.as_deref());
            crate::hlog!("roster: {} user(s) loaded", st.users.len());
            self.emit(st.roster_changed());
            st.filter.has_messages
        };

        if fan_out {
            self.refresh_message_index().await;
        }
        Ok(())
    }

    /// Roster, plus the open conversation if there is one.
    pub async fn refresh(&self) -> Result<(), DashboardError> {
        self.refresh_roster().await?;
        let selected = self.state.lock().await.selected.is_some();
        if selected {
            self.load_messages().await?;
        }
        Ok(())
    }

    async fn refresh_message_index(&self) {
        let (caller, users) = {
            let st = self.state.lock().await;
            match &st.caller {
                Some(c) => (c.id.clone(), st.users.clone()),
                None => return,
            }
        };
        let ids = roster::counterparts_with_messages(&self.backend, &caller, &users).await;

        let mut st = self.state.lock().await;
        if st.caller.as_ref().map(|c| c.id.as_str()) != Some(caller.as_str()) {
            return;
        }
        st.with_messages = Some(ids);
        self.emit(st.roster_changed());
    }

    /// Apply a new roster filter. Turning on has-messages reruns the
    /// conversation fan-out.
    pub async fn set_filter(&self, filter: RosterFilter) -> Vec<Profile> {
        let fan_out = {
            let mut st = self.state.lock().await;
            let fan_out =
                filter.has_messages && (!st.filter.has_messages || st.with_messages.is_none());
            st.filter = filter;
            if !fan_out {
                self.emit(st.roster_changed());
            }
            fan_out
        };
        if fan_out {
            self.refresh_message_index().await;
        }
        self.state.lock().await.visible_users()
    }

    /// Open the conversation with `user_id`.
    pub async fn select(&self, user_id: &str) -> Result<(), DashboardError> {
        {
            let mut st = self.state.lock().await;
            let caller = st
                .caller
                .as_ref()
                .ok_or(DashboardError::NotSignedIn)?
                .id
                .clone();
            if !st.users.iter().any(|u| u.id == user_id) {
                return Err(DashboardError::UnknownUser(user_id.to_string()));
            }
            st.selected = Some(user_id.to_string());
            st.timeline.clear();

            let scope = ConversationScope::new(caller, user_id);
            let previous = st.bridge.scope().map(|s| s.topic());
            let opened = st.bridge.ensure(&self.backend, scope, self.changes.clone());
            match opened {
                Ok(true) => {
                    if let Some(topic) = previous {
                        st.joined.remove(&topic);
                    }
                }
                Ok(false) => {}
                Err(e) => self.record_error(&mut st, e.to_string()),
            }
        }
        self.load_messages().await
    }

    /// Fetch the open conversation's history, then mark inbound messages
    /// read. A reply for a conversation that is no longer open is dropped.
    pub async fn load_messages(&self) -> Result<(), DashboardError> {
        let (scope, generation, since) = {
            let mut st = self.state.lock().await;
            let scope = st.scope().ok_or(DashboardError::NoConversation)?;
            st.messages_loading = true;
            st.load_generation += 1;
            (scope, st.load_generation, st.timeline.revision())
        };

        let (a, b) = (scope.caller.clone(), scope.counterpart.clone());
        let history = backend::blocking(&self.backend, move |be| be.conversation(&a, &b)).await;

        {
            let mut st = self.state.lock().await;
            if st.load_generation == generation {
                st.messages_loading = false;
            }
            if st.scope().as_ref() != Some(&scope) {
                crate::hlog!("messages: dropped stale history for {}", scope.topic());
                return Ok(());
            }
            match history {
                Ok(history) => {
                    st.timeline.replace_history(history, since);
                    self.emit(DashboardEvent::TimelineReloaded {
                        counterpart: scope.counterpart.clone(),
                        count: st.timeline.len(),
                    });
                }
                Err(e) => {
                    self.record_error(&mut st, e.to_string());
                    return Err(e.into());
                }
            }
        }

        self.mark_read().await
    }

    /// Show `text` immediately as a provisional message and write it in the
    /// background.
    pub async fn send(&self, text: &str) -> Result<PendingSend, DashboardError> {
        if text.trim().is_empty() {
            return Err(DashboardError::EmptyMessage);
        }
        let (provisional, row) = {
            let mut st = self.state.lock().await;
            let scope = match st.scope() {
                Some(scope) => scope,
                None if st.caller.is_none() => return Err(DashboardError::NotSignedIn),
                None => return Err(DashboardError::NoConversation),
            };
            let provisional =
                st.timeline
                    .push_pending(&scope.caller, &scope.counterpart, text, Utc::now());
            if let Some(ids) = st.with_messages.as_mut() {
                ids.insert(scope.counterpart.clone());
            }
            let row = NewMessage::from(&provisional);
            (provisional, row)
        };
        self.emit(DashboardEvent::MessageAppended {
            message: provisional.clone(),
            pending: true,
        });

        let client_ref = provisional.client_ref.clone().unwrap_or_default();
        let this = self.clone();
        let completion = tokio::spawn(async move { this.complete_send(row, client_ref).await });
        Ok(PendingSend {
            provisional,
            completion,
        })
    }

    async fn complete_send(&self, row: NewMessage, client_ref: String) -> SendOutcome {
        let written = backend::blocking(&self.backend, move |b| b.insert_message(&row)).await;
        let mut st = self.state.lock().await;
        match written {
            Ok(stored) => {
                let in_scope = st.scope().map(|s| s.covers(&stored)).unwrap_or(false);
                if in_scope {
                    match st.timeline.merge(stored.clone(), MergeMode::Insert) {
                        MergeOutcome::Confirmed { client_ref } => {
                            self.emit(DashboardEvent::MessageConfirmed {
                                client_ref,
                                message: stored.clone(),
                            })
                        }
                        MergeOutcome::Appended => self.emit(DashboardEvent::MessageAppended {
                            message: stored.clone(),
                            pending: false,
                        }),
                        _ => {}
                    }
                }
                crate::hlog!("send: {} stored", logging::msg_id(&stored.id));
                SendOutcome::Delivered(stored)
            }
            Err(e) => {
                let reason = format!("Failed to send message: {e}");
                if let Some(removed) = st.timeline.reject(&client_ref) {
                    self.emit(DashboardEvent::MessageRemoved {
                        id: removed.id,
                        client_ref: Some(client_ref),
                        reason: reason.clone(),
                    });
                }
                self.record_error(&mut st, reason.clone());
                SendOutcome::Failed(reason)
            }
        }
    }

    /// Mark everything the counterpart sent to the caller as read.
    pub async fn mark_read(&self) -> Result<(), DashboardError> {
        let scope = self
            .state
            .lock()
            .await
            .scope()
            .ok_or(DashboardError::NoConversation)?;
        let (reader, counterpart) = (scope.caller.clone(), scope.counterpart.clone());
        let marked =
            backend::blocking(&self.backend, move |b| b.mark_read(&reader, &counterpart)).await;

        let mut st = self.state.lock().await;
        if let Err(e) = marked {
            self.record_error(&mut st, e.to_string());
            return Err(e.into());
        }
        if st.scope().as_ref() != Some(&scope) {
            return Ok(());
        }
        let count = st
            .timeline
            .mark_read_local(&scope.counterpart, &scope.caller);
        if count > 0 {
            self.emit(DashboardEvent::MessagesRead {
                sender: scope.counterpart,
                receiver: scope.caller,
                count,
            });
        }
        Ok(())
    }

    /// Apply one item from a realtime channel.
    pub async fn handle(&self, inbound: ChannelMessage) {
        match inbound {
            ChannelMessage::Joined { topic } => {
                let mut st = self.state.lock().await;
                if st.is_tracked_topic(&topic) {
                    st.joined.insert(topic.clone());
                    self.emit(DashboardEvent::RealtimeStatus {
                        topic,
                        connected: true,
                        reason: None,
                    });
                }
            }
            ChannelMessage::Dropped { topic, reason } => {
                let mut st = self.state.lock().await;
                if st.is_tracked_topic(&topic) {
                    st.joined.remove(&topic);
                    self.emit(DashboardEvent::RealtimeStatus {
                        topic,
                        connected: false,
                        reason: Some(reason),
                    });
                }
            }
            ChannelMessage::Change(event) => match realtime::classify(&event) {
                Inbound::Message { mode, message } => self.apply_message(mode, message).await,
                Inbound::Presence(update) => self.apply_presence(update).await,
                Inbound::Ignored => {}
            },
        }
    }

    async fn apply_message(&self, mode: MergeMode, message: Message) {
        let (outcome, scope) = {
            let mut st = self.state.lock().await;
            let Some(scope) = st.bridge.scope().cloned() else {
                return;
            };
            if st.scope().as_ref() != Some(&scope) || !scope.covers(&message) {
                return;
            }
            let outcome = st.timeline.merge(message.clone(), mode);
            if let Some(ids) = st.with_messages.as_mut() {
                ids.insert(scope.counterpart.clone());
            }
            (outcome, scope)
        };

        let unread_inbound = message.receiver == scope.caller && !message.read;
        match outcome {
            MergeOutcome::Appended => self.emit(DashboardEvent::MessageAppended {
                message,
                pending: false,
            }),
            MergeOutcome::Confirmed { client_ref } => {
                self.emit(DashboardEvent::MessageConfirmed {
                    client_ref,
                    message,
                });
            }
            MergeOutcome::Replaced => self.emit(DashboardEvent::MessageUpdated { message }),
            MergeOutcome::Duplicate | MergeOutcome::Ignored => return,
        }

        if mode == MergeMode::Insert && unread_inbound {
            // Failure is already recorded on the dashboard.
            let _ = self.mark_read().await;
        }
    }

    async fn apply_presence(&self, update: PresenceUpdate) {
        let mut st = self.state.lock().await;
        let mut touched = roster::apply_presence(&mut st.users, &update);
        if let Some(me) = st.caller.as_mut().filter(|c| c.id == update.id) {
            me.status = update.status.clone();
            me.last_seen = update.last_seen;
            touched = true;
        }
        if touched {
            self.emit(DashboardEvent::PresenceChanged {
                id: update.id,
                status: update.status,
                last_seen: update.last_seen,
            });
        }
    }

    /// Replace the caller's profile after a settings change.
    pub async fn set_caller(&self, profile: Profile) {
        let mut st = self.state.lock().await;
        if st.caller.as_ref().map(|c| c.id == profile.id).unwrap_or(false) {
            st.caller = Some(profile);
        }
    }

    pub async fn clear_error(&self) {
        self.state.lock().await.error = None;
    }

    pub async fn snapshot(&self) -> DashboardView {
        let st = self.state.lock().await;
        let selected = st
            .selected
            .as_ref()
            .and_then(|id| st.users.iter().find(|u| &u.id == id))
            .cloned();
        DashboardView {
            caller: st.caller.clone(),
            users: st.visible_users(),
            total_users: st.users.len(),
            filter: st.filter.clone(),
            selected,
            messages: st.timeline.clone(),
            error: st.error.clone(),
            loading: st.loading,
            messages_loading: st.messages_loading,
            realtime: st.joined.iter().cloned().collect(),
        }
    }
}
