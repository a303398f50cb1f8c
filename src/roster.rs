//! The list of other users shown beside the conversation, and the filters
//! applied to it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{self, Backend};
use crate::model::{Profile, Status};

/// Everyone except the caller. With no caller id the list is returned as is.
pub fn exclude_caller(users: Vec<Profile>, caller_id: Option<&str>) -> Vec<Profile> {
    match caller_id {
        Some(id) => users.into_iter().filter(|u| u.id != id).collect(),
        None => users,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterFilter {
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub online_only: bool,
    #[serde(default)]
    pub has_messages: bool,
}

impl RosterFilter {
    /// Username matches case-insensitively; phone number by plain substring.
    /// A blank term matches everyone; otherwise the term is used as typed,
    /// surrounding spaces included.
    pub fn matches_search(&self, user: &Profile) -> bool {
        if self.search.trim().is_empty() {
            return true;
        }
        let needle = self.search.as_str();
        if user
            .username
            .to_lowercase()
            .contains(&needle.to_lowercase())
        {
            return true;
        }
        user.phone_number
            .as_deref()
            .map(|p| p.contains(needle))
            .unwrap_or(false)
    }
}

/// Apply every active criterion. `with_messages` is the set of counterpart
/// ids known to share a conversation with the caller; while it is `None` the
/// has-messages criterion is not applied.
pub fn filter_roster(
    users: &[Profile],
    filter: &RosterFilter,
    with_messages: Option<&HashSet<String>>,
) -> Vec<Profile> {
    users
        .iter()
        .filter(|u| filter.matches_search(u))
        .filter(|u| !filter.online_only || u.status.is_online())
        .filter(|u| match (filter.has_messages, with_messages) {
            (true, Some(ids)) => ids.contains(&u.id),
            _ => true,
        })
        .cloned()
        .collect()
}

/// Ids of the users that share at least one message with `caller`.
///
/// One conversation fetch per candidate, all in flight at once. A failed
/// fetch counts as no messages.
pub async fn counterparts_with_messages(
    backend: &Arc<dyn Backend>,
    caller: &str,
    users: &[Profile],
) -> HashSet<String> {
    let lookups = users.iter().map(|user| {
        let caller = caller.to_string();
        let other = user.id.clone();
        async move {
            let lookup_id = other.clone();
            let found =
                backend::blocking(backend, move |b| b.conversation(&caller, &lookup_id)).await;
            match found {
                Ok(messages) if !messages.is_empty() => Some(other),
                Ok(_) => None,
                Err(e) => {
                    crate::hlog!(
                        "roster: message lookup for {} failed: {}",
                        crate::logging::user_id(&other),
                        e
                    );
                    None
                }
            }
        }
    });
    futures_util::future::join_all(lookups)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// The presence columns of a changed profile row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceUpdate {
    pub id: String,
    pub status: Status,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceUpdate {
    pub fn from_record(record: &serde_json::Value) -> Option<Self> {
        let profile: Profile = serde_json::from_value(record.clone()).ok()?;
        Some(Self::from(&profile))
    }
}

impl From<&Profile> for PresenceUpdate {
    fn from(p: &Profile) -> Self {
        Self {
            id: p.id.clone(),
            status: p.status.clone(),
            last_seen: p.last_seen,
        }
    }
}

/// Update status and last-seen of the matching user. Returns whether one
/// matched.
pub fn apply_presence(users: &mut [Profile], update: &PresenceUpdate) -> bool {
    match users.iter_mut().find(|u| u.id == update.id) {
        Some(user) => {
            user.status = update.status.clone();
            user.last_seen = update.last_seen;
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::model::NewMessage;

    fn user(id: &str, username: &str, phone: Option<&str>, status: Status) -> Profile {
        Profile {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            username: username.to_string(),
            phone_number: phone.map(str::to_string),
            status,
            avatar_url: None,
            last_seen: None,
            created_at: None,
            groups: Vec::new(),
        }
    }

    fn roster() -> Vec<Profile> {
        vec![
            user("u1", "Alice", Some("555-0100"), Status::Online),
            user("u2", "bob", None, Status::Offline),
            user("u3", "Carol", Some("555-0199"), Status::Custom("in a meeting".into())),
        ]
    }

    fn ids(users: &[Profile]) -> Vec<&str> {
        users.iter().map(|u| u.id.as_str()).collect()
    }

    #[test]
    fn caller_is_excluded() {
        assert_eq!(ids(&exclude_caller(roster(), Some("u2"))), ["u1", "u3"]);
        assert_eq!(exclude_caller(roster(), None).len(), 3);
    }

    #[test]
    fn search_matches_username_or_phone() {
        let users = roster();
        let by_name = RosterFilter {
            search: "ALI".into(),
            ..Default::default()
        };
        assert_eq!(ids(&filter_roster(&users, &by_name, None)), ["u1"]);

        let by_phone = RosterFilter {
            search: "0199".into(),
            ..Default::default()
        };
        assert_eq!(ids(&filter_roster(&users, &by_phone, None)), ["u3"]);

        let blank = RosterFilter {
            search: "   ".into(),
            ..Default::default()
        };
        assert_eq!(filter_roster(&users, &blank, None).len(), 3);
    }

    #[test]
    fn search_term_is_not_trimmed() {
        let users = roster();
        let trailing = RosterFilter {
            search: "ali ".into(),
            ..Default::default()
        };
        assert!(filter_roster(&users, &trailing, None).is_empty());

        let leading = RosterFilter {
            search: " 555".into(),
            ..Default::default()
        };
        assert!(filter_roster(&users, &leading, None).is_empty());
    }

    #[test]
    fn online_only_excludes_custom_status() {
        let filter = RosterFilter {
            online_only: true,
            ..Default::default()
        };
        assert_eq!(ids(&filter_roster(&roster(), &filter, None)), ["u1"]);
    }

    #[test]
    fn criteria_combine_conjunctively() {
        let with: HashSet<String> = ["u1".to_string(), "u2".to_string()].into();
        let filter = RosterFilter {
            search: "b".into(),
            online_only: false,
            has_messages: true,
        };
        assert_eq!(ids(&filter_roster(&roster(), &filter, Some(&with))), ["u2"]);

        let none: HashSet<String> = HashSet::new();
        assert!(filter_roster(&roster(), &filter, Some(&none)).is_empty());
        // Fan-out not known yet: criterion skipped.
        assert_eq!(ids(&filter_roster(&roster(), &filter, None)), ["u2"]);
    }

    #[test]
    fn presence_update_touches_only_presence() {
        let mut users = roster();
        let update = PresenceUpdate::from_record(&serde_json::json!({
            "id": "u2",
            "email": "ignored@example.com",
            "username": "renamed",
            "status": "online",
            "last_seen": "2024-05-01T10:00:00Z",
        }))
        .unwrap();
        assert!(apply_presence(&mut users, &update));
        assert!(users[1].status.is_online());
        assert!(users[1].last_seen.is_some());
        assert_eq!(users[1].username, "bob");
        assert_eq!(users[1].email, "u2@example.com");

        let stranger = PresenceUpdate {
            id: "zz".into(),
            status: Status::Online,
            last_seen: None,
        };
        assert!(!apply_presence(&mut users, &stranger));
    }

    #[test]
    fn malformed_presence_record_is_rejected() {
        assert!(PresenceUpdate::from_record(&serde_json::json!({"status": "online"})).is_none());
    }

    #[tokio::test]
    async fn fan_out_finds_counterparts_with_history() {
        let memory = MemoryBackend::default();
        let me = memory.seed_user("me@example.com", "secret1", "me");
        let talker = memory.seed_user("t@example.com", "secret1", "talker");
        let quiet = memory.seed_user("q@example.com", "secret1", "quiet");
        memory.deliver(&NewMessage {
            sender: talker.id.clone(),
            receiver: me.id.clone(),
            text: "hey".into(),
            timestamp: Utc::now(),
            read: false,
            client_ref: None,
        });

        let backend: Arc<dyn Backend> = Arc::new(memory);
        let found =
            counterparts_with_messages(&backend, &me.id, &[talker.clone(), quiet.clone()]).await;
        assert!(found.contains(&talker.id));
        assert!(!found.contains(&quiet.id));
    }
}
