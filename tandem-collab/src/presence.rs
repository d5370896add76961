//! Presence tracker: who is viewing each project room.
//!
//! Presence is derived, never written directly. It is the union of the
//! identities bound to the room's member connections, deduplicated by user
//! id. The tracker remembers the user set it last announced per room so
//! that membership churn which leaves the set unchanged (a second tab
//! closing) does not produce a broadcast.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{ProjectId, UserId, UserInfo};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomManager;

/// Outcome of recomputing a room's presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub users: Vec<UserInfo>,
    /// The distinct user set differs from the last announced one.
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    announced: HashMap<ProjectId, BTreeMap<UserId, UserInfo>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current presence of a room, one entry per distinct user.
    ///
    /// Connections without a bound identity are not counted. Order is by
    /// user id, but consumers must not rely on it.
    pub fn snapshot(
        &self,
        project: &str,
        rooms: &RoomManager,
        registry: &ConnectionRegistry,
    ) -> Vec<UserInfo> {
        Self::collect(project, rooms, registry).into_values().collect()
    }

    /// Recompute a room's presence and record it as announced.
    pub fn recompute(
        &mut self,
        project: &str,
        rooms: &RoomManager,
        registry: &ConnectionRegistry,
    ) -> PresenceChange {
        let current = Self::collect(project, rooms, registry);
        let changed = match self.announced.get(project) {
            Some(previous) => previous.keys().ne(current.keys()),
            None => !current.is_empty(),
        };

        let users = current.values().cloned().collect();
        if current.is_empty() {
            self.announced.remove(project);
        } else {
            self.announced.insert(project.to_string(), current);
        }

        PresenceChange { users, changed }
    }

    fn collect(
        project: &str,
        rooms: &RoomManager,
        registry: &ConnectionRegistry,
    ) -> BTreeMap<UserId, UserInfo> {
        rooms
            .members(project)
            .iter()
            .filter_map(|conn| registry.user_of(conn))
            .map(|user| (user.id.clone(), user.clone()))
            .collect()
    }

    /// Rooms with at least one announced user.
    pub fn tracked_rooms(&self) -> usize {
        self.announced.len()
    }
}
