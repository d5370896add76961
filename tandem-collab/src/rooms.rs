//! Room manager: maps project ids to the connections viewing them.
//!
//! Rooms are created on first join and removed once the last member
//! leaves. Membership is per connection, not per user; one user with two
//! tabs is two members.

use std::collections::{HashMap, HashSet};

use crate::protocol::{ConnectionId, ProjectId};

#[derive(Debug, Default)]
struct Room {
    members: HashSet<ConnectionId>,
}

/// Result of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Membership changed.
    Changed,
    /// Membership changed and the room was torn down.
    RoomClosed,
    /// Nothing to do (already joined / never joined).
    Unchanged,
}

#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: HashMap<ProjectId, Room>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed. Idempotent.
    pub fn join(&mut self, conn: ConnectionId, project: &str) -> Membership {
        let room = self.rooms.entry(project.to_string()).or_default();
        if room.members.insert(conn) {
            Membership::Changed
        } else {
            Membership::Unchanged
        }
    }

    /// Remove a connection from a room. Leaving a room never joined is a
    /// no-op.
    pub fn leave(&mut self, conn: &ConnectionId, project: &str) -> Membership {
        let Some(room) = self.rooms.get_mut(project) else {
            return Membership::Unchanged;
        };
        if !room.members.remove(conn) {
            return Membership::Unchanged;
        }
        if room.members.is_empty() {
            self.rooms.remove(project);
            log::debug!("Room {project} removed (empty)");
            return Membership::RoomClosed;
        }
        Membership::Changed
    }

    pub fn members(&self, project: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(project)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn: &ConnectionId, project: &str) -> bool {
        self.rooms
            .get(project)
            .is_some_and(|r| r.members.contains(conn))
    }

    pub fn member_count(&self, project: &str) -> usize {
        self.rooms.get(project).map_or(0, |r| r.members.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn active_rooms(&self) -> Vec<ProjectId> {
        self.rooms.keys().cloned().collect()
    }
}
