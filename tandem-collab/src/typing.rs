//! Typing aggregator: who is composing input on which task.
//!
//! Clients send `typing-start` periodically while composing; each start
//! refreshes the entry. Entries that are not refreshed within the TTL are
//! collected by the sweep, which emits a synthetic stop for each.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::protocol::{EntityId, ProjectId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub entity_id: EntityId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub user_name: String,
    pub started_at: Instant,
    pub refreshed_at: Instant,
}

pub struct TypingAggregator {
    /// entity → user → entry
    entries: HashMap<EntityId, HashMap<UserId, TypingEntry>>,
    ttl: Duration,
}

impl TypingAggregator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Upsert an entry. Returns `true` if the user was not already typing
    /// on this entity.
    pub fn start(
        &mut self,
        project: &str,
        entity: &str,
        user: &str,
        user_name: &str,
        now: Instant,
    ) -> bool {
        let typists = self.entries.entry(entity.to_string()).or_default();
        match typists.get_mut(user) {
            Some(entry) => {
                entry.project_id = project.to_string();
                entry.refreshed_at = now;
                entry.user_name = user_name.to_string();
                false
            }
            None => {
                typists.insert(
                    user.to_string(),
                    TypingEntry {
                        entity_id: entity.to_string(),
                        project_id: project.to_string(),
                        user_id: user.to_string(),
                        user_name: user_name.to_string(),
                        started_at: now,
                        refreshed_at: now,
                    },
                );
                true
            }
        }
    }

    /// Remove an entry; `None` if there was nothing to stop.
    pub fn stop(&mut self, entity: &str, user: &str) -> Option<TypingEntry> {
        let typists = self.entries.get_mut(entity)?;
        let entry = typists.remove(user)?;
        if typists.is_empty() {
            self.entries.remove(entity);
        }
        Some(entry)
    }

    /// Remove every entry of a user (their last connection dropped).
    pub fn remove_user(&mut self, user: &str) -> Vec<TypingEntry> {
        let mut removed = Vec::new();
        self.entries.retain(|_, typists| {
            if let Some(entry) = typists.remove(user) {
                removed.push(entry);
            }
            !typists.is_empty()
        });
        removed
    }

    /// Remove entries not refreshed within the TTL. Each expired entry is
    /// returned exactly once.
    pub fn expire(&mut self, now: Instant) -> Vec<TypingEntry> {
        let ttl = self.ttl;
        let mut expired = Vec::new();
        self.entries.retain(|_, typists| {
            typists.retain(|_, entry| {
                let alive = now.saturating_duration_since(entry.refreshed_at) <= ttl;
                if !alive {
                    expired.push(entry.clone());
                }
                alive
            });
            !typists.is_empty()
        });
        if !expired.is_empty() {
            log::trace!("Expired {} typing entries", expired.len());
        }
        expired
    }

    pub fn typists(&self, entity: &str) -> Vec<&TypingEntry> {
        self.entries
            .get(entity)
            .map(|t| t.values().collect())
            .unwrap_or_default()
    }

    pub fn typing_in(&self, project: &str) -> Vec<&TypingEntry> {
        self.entries
            .values()
            .flat_map(|t| t.values())
            .filter(|e| e.project_id == project)
            .collect()
    }

    /// Total number of active entries.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
