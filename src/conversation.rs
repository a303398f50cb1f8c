//! The selected conversation's message timeline.
//!
//! Entries are either confirmed rows from the platform or provisional copies
//! of messages this client is still writing. A provisional entry carries the
//! `client_ref` token that the platform stores on the row, so whichever of
//! the write reply or the realtime insert arrives first confirms it and the
//! other one lands as a duplicate. Every mutation goes through [`Timeline::merge`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::Message;

pub const PROVISIONAL_ID_PREFIX: &str = "temp-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Delivery {
    Pending { client_ref: String },
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    #[serde(flatten)]
    pub message: Message,
    pub delivery: Delivery,
    /// Timeline revision at which this entry was last written; 0 for rows
    /// that came from a history fetch.
    #[serde(skip)]
    revision: u64,
}

impl Entry {
    fn confirmed(message: Message, revision: u64) -> Self {
        Self {
            message,
            delivery: Delivery::Confirmed,
            revision,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }

    fn pending_ref(&self) -> Option<&str> {
        match &self.delivery {
            Delivery::Pending { client_ref } => Some(client_ref),
            Delivery::Confirmed => None,
        }
    }
}

/// How an incoming row should be treated when its id is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    /// A provisional entry was replaced by its authoritative row.
    Confirmed { client_ref: String },
    Replaced,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Timeline {
    entries: Vec<Entry>,
    #[serde(skip)]
    revision: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from fetched history: sorted by timestamp (stable),
    /// first occurrence of each id kept.
    pub fn from_history(history: Vec<Message>) -> Self {
        let mut history = history;
        history.sort_by_key(|m| m.timestamp);
        let mut seen = HashSet::new();
        let entries = history
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .map(|m| Entry::confirmed(m, 0))
            .collect();
        Self {
            entries,
            revision: 0,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position_of(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    /// Bumped by every local write. Take it before fetching history and
    /// hand it to [`Timeline::replace_history`].
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Empties the timeline; the revision keeps counting.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Append a provisional message and return it.
    pub fn push_pending(
        &mut self,
        sender: &str,
        receiver: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Message {
        let client_ref = Uuid::new_v4().to_string();
        let message = Message {
            id: format!("{PROVISIONAL_ID_PREFIX}{client_ref}"),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            text: text.to_string(),
            timestamp: now,
            read: false,
            client_ref: Some(client_ref.clone()),
        };
        let revision = self.next_revision();
        self.insert_sorted(Entry {
            message: message.clone(),
            delivery: Delivery::Pending { client_ref },
            revision,
        });
        message
    }

    pub fn merge(&mut self, message: Message, mode: MergeMode) -> MergeOutcome {
        let revision = self.revision + 1;
        let outcome = self.merge_at(message, mode, revision);
        if !matches!(outcome, MergeOutcome::Duplicate | MergeOutcome::Ignored) {
            self.revision = revision;
        }
        outcome
    }

    fn merge_at(&mut self, message: Message, mode: MergeMode, revision: u64) -> MergeOutcome {
        if let Some(i) = self.position_of(&message.id) {
            return match mode {
                MergeMode::Insert => MergeOutcome::Duplicate,
                MergeMode::Update => {
                    // Last arrival wins; the timestamp may have moved.
                    self.entries.remove(i);
                    self.insert_sorted(Entry::confirmed(message, revision));
                    MergeOutcome::Replaced
                }
            };
        }

        if let Some(client_ref) = message.client_ref.clone() {
            if let Some(i) = self
                .entries
                .iter()
                .position(|e| e.pending_ref() == Some(client_ref.as_str()))
            {
                self.entries.remove(i);
                self.insert_sorted(Entry::confirmed(message, revision));
                return MergeOutcome::Confirmed { client_ref };
            }
        }

        match mode {
            MergeMode::Insert => {
                self.insert_sorted(Entry::confirmed(message, revision));
                MergeOutcome::Appended
            }
            MergeMode::Update => MergeOutcome::Ignored,
        }
    }

    /// Drop a provisional entry whose write failed.
    pub fn reject(&mut self, client_ref: &str) -> Option<Message> {
        let i = self
            .entries
            .iter()
            .position(|e| e.pending_ref() == Some(client_ref))?;
        Some(self.entries.remove(i).message)
    }

    /// Swap in history fetched when the timeline was at revision `since`.
    ///
    /// Kept on top of the fetched rows: provisional entries the history does
    /// not confirm, and confirmed entries written after `since` (a send reply
    /// or realtime row the snapshot may predate). Those win over the fetched
    /// copy of the same id.
    pub fn replace_history(&mut self, history: Vec<Message>, since: u64) {
        let mut fresh = Self::from_history(history).entries;
        let confirmed_refs: HashSet<String> = fresh
            .iter()
            .filter_map(|e| e.message.client_ref.clone())
            .collect();
        let kept: Vec<Entry> = self
            .entries
            .drain(..)
            .filter(|e| match e.pending_ref() {
                Some(r) => !confirmed_refs.contains(r),
                None => e.revision > since,
            })
            .collect();
        let kept_ids: HashSet<&str> = kept.iter().map(|e| e.message.id.as_str()).collect();
        fresh.retain(|e| !kept_ids.contains(e.message.id.as_str()));

        self.entries = fresh;
        for entry in kept {
            self.insert_sorted(entry);
        }
    }

    /// Flip `read` on confirmed messages from `sender` to `receiver`.
    pub fn mark_read_local(&mut self, sender: &str, receiver: &str) -> usize {
        let mut flipped = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.is_pending()) {
            let m = &mut entry.message;
            if m.sender == sender && m.receiver == receiver && !m.read {
                m.read = true;
                flipped += 1;
            }
        }
        flipped
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == id)
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let ts = entry.message.timestamp;
        let at = self.entries.partition_point(|e| e.message.timestamp <= ts);
        self.entries.insert(at, entry);
    }
}
