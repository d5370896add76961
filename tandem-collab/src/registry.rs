//! Connection registry: the table of live transport connections.
//!
//! Each connection owns a bounded outbound queue. Delivery into that queue
//! is `try_send` only, so a slow or dead client can never stall whoever is
//! broadcasting; a full queue drops the message for that recipient alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ConnectionId, ProjectId, ServerEvent, UserId, UserInfo};

/// Outbound half handed to the transport task.
pub type Outbound = mpsc::Receiver<Arc<ServerEvent>>;

/// One live transport connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Bound identity; `None` until `authenticate` succeeds.
    pub user: Option<UserInfo>,
    pub rooms: HashSet<ProjectId>,
    pub last_activity: Instant,
    sender: mpsc::Sender<Arc<ServerEvent>>,
}

/// Result of queueing one event for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Recipient's queue is full; the event was dropped for it.
    Full,
    /// Recipient's transport task is gone.
    Closed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Connection {0} is already bound to user {1}")]
    AlreadyBound(ConnectionId, UserId),
}

pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    /// user id → that user's live connections
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    outbound_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            connections: HashMap::new(),
            by_user: HashMap::new(),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Admit a new, unauthenticated connection.
    pub fn admit(&mut self, now: Instant) -> (ConnectionId, Outbound) {
        let (sender, receiver) = mpsc::channel(self.outbound_capacity);
        let id = Uuid::new_v4();
        self.connections.insert(
            id,
            Connection {
                id,
                user: None,
                rooms: HashSet::new(),
                last_activity: now,
                sender,
            },
        );
        (id, receiver)
    }

    /// Bind an identity to a connection. Identity is set once per connection;
    /// re-binding the same user is accepted, binding a different one is not.
    pub fn bind_identity(&mut self, id: ConnectionId, user: UserInfo) -> Result<(), RegistryError> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;

        if let Some(existing) = &conn.user {
            if existing.id != user.id {
                return Err(RegistryError::AlreadyBound(id, existing.id.clone()));
            }
        }

        self.by_user.entry(user.id.clone()).or_default().insert(id);
        conn.user = Some(user);
        Ok(())
    }

    /// Remove a connection from the table and return it.
    ///
    /// Dropping the returned value closes its outbound queue, which in turn
    /// ends the transport task.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(id)?;
        if let Some(user) = &conn.user {
            if let Some(set) = self.by_user.get_mut(&user.id) {
                set.remove(id);
                if set.is_empty() {
                    self.by_user.remove(&user.id);
                }
            }
        }
        Some(conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn user_of(&self, id: &ConnectionId) -> Option<&UserInfo> {
        self.connections.get(id).and_then(|c| c.user.as_ref())
    }

    pub fn touch(&mut self, id: &ConnectionId, now: Instant) {
        if let Some(conn) = self.connections.get_mut(id) {
            conn.last_activity = now;
        }
    }

    /// Record that a connection joined a room. Returns `false` if it was
    /// already recorded (or the connection is unknown).
    pub fn add_room(&mut self, id: &ConnectionId, project: &str) -> bool {
        self.connections
            .get_mut(id)
            .is_some_and(|c| c.rooms.insert(project.to_string()))
    }

    pub fn remove_room(&mut self, id: &ConnectionId, project: &str) -> bool {
        self.connections
            .get_mut(id)
            .is_some_and(|c| c.rooms.remove(project))
    }

    pub fn in_room(&self, id: &ConnectionId, project: &str) -> bool {
        self.connections
            .get(id)
            .is_some_and(|c| c.rooms.contains(project))
    }

    /// Number of live connections bound to `user`.
    pub fn connections_of(&self, user: &str) -> usize {
        self.by_user.get(user).map_or(0, HashSet::len)
    }

    /// Connections idle for longer than `timeout`.
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| now.saturating_duration_since(c.last_activity) > timeout)
            .map(|c| c.id)
            .collect()
    }

    /// Queue an event for one connection without waiting.
    pub fn deliver(&self, id: &ConnectionId, event: &Arc<ServerEvent>) -> Delivery {
        let Some(conn) = self.connections.get(id) else {
            return Delivery::Unknown;
        };
        match conn.sender.try_send(event.clone()) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
