//! Client-side mirror of presence, edit claims and typing indicators.
//!
//! Built purely from [`ServerEvent`]s. Presence updates are full snapshots
//! and replace what was there; claim and typing notices are applied
//! incrementally. The whole view is discarded when the transport drops and
//! rebuilt from the snapshots that follow the re-join.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{ActivityNotice, EntityId, ProjectId, ServerEvent, UserId, UserInfo};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalView {
    user_id: Option<UserId>,
    presence: HashMap<ProjectId, Vec<UserInfo>>,
    editors: HashMap<EntityId, ActivityNotice>,
    typing: HashMap<EntityId, BTreeMap<UserId, String>>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one server event into the view. Returns `true` if anything
    /// changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Authenticated { user_id } => {
                self.user_id.replace(user_id.clone()).as_ref() != Some(user_id)
            }
            ServerEvent::PresenceUpdate { project_id, users } => {
                let previous = self.presence.insert(project_id.clone(), users.clone());
                previous.as_ref() != Some(users)
            }
            ServerEvent::EditClaimStarted(notice) => {
                let previous = self.editors.insert(notice.task_id.clone(), notice.clone());
                previous.as_ref() != Some(notice)
            }
            ServerEvent::EditClaimStopped(notice) => {
                match self.editors.get(&notice.task_id) {
                    Some(current) if current.user_id == notice.user_id => {
                        self.editors.remove(&notice.task_id);
                        true
                    }
                    _ => false,
                }
            }
            ServerEvent::TypingStarted(notice) => self
                .typing
                .entry(notice.task_id.clone())
                .or_default()
                .insert(notice.user_id.clone(), notice.user_name.clone())
                .is_none(),
            ServerEvent::TypingStopped(notice) => {
                let Some(typists) = self.typing.get_mut(&notice.task_id) else {
                    return false;
                };
                let removed = typists.remove(&notice.user_id).is_some();
                if typists.is_empty() {
                    self.typing.remove(&notice.task_id);
                }
                removed
            }
            _ => false,
        }
    }

    /// Forget a room's presence after leaving it. Claims and typing are
    /// keyed by entity and age out through their stop notices.
    pub fn forget_room(&mut self, project: &str) {
        self.presence.remove(project);
    }

    /// Drop everything. Called as soon as the transport is lost.
    pub fn clear(&mut self) {
        self.user_id = None;
        self.presence.clear();
        self.editors.clear();
        self.typing.clear();
    }

    /// Identity the server bound to this connection.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn viewers(&self, project: &str) -> &[UserInfo] {
        self.presence.get(project).map_or(&[], Vec::as_slice)
    }

    pub fn editor_of(&self, task: &str) -> Option<&ActivityNotice> {
        self.editors.get(task)
    }

    /// Display names of users typing into `task`, ordered by user id.
    pub fn typists(&self, task: &str) -> Vec<&str> {
        self.typing
            .get(task)
            .map(|t| t.values().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.presence.is_empty()
            && self.editors.is_empty()
            && self.typing.is_empty()
    }
}
