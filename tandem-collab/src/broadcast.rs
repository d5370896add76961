//! Fan-out of server events to room members.
//!
//! Delivery is fire-and-forget per recipient: each event is built once,
//! shared behind an `Arc`, and `try_send`-ed into every recipient's
//! outbound queue. A recipient whose queue is full or closed loses that
//! event; nobody else is affected. Within one call recipients are served
//! in order, and since all calls run under the hub lock, events to a room
//! keep their publish order.
//!
//! Stats are atomics so they can be read without touching the hub lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ChangeEvent, ConnectionId, ServerEvent};
use crate::registry::{ConnectionRegistry, Delivery};
use crate::rooms::RoomManager;

/// Statistics for monitoring delivery health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub changes_published: u64,
}

#[derive(Debug, Default)]
pub struct Fanout {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    changes_published: AtomicU64,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for a single connection.
    pub fn send_to(&self, registry: &ConnectionRegistry, conn: &ConnectionId, event: ServerEvent) -> bool {
        self.deliver(registry, conn, &Arc::new(event))
    }

    /// Queue an event for every given connection. Returns how many
    /// recipients it was queued for.
    pub fn send_to_all(
        &self,
        registry: &ConnectionRegistry,
        recipients: &[ConnectionId],
        event: ServerEvent,
    ) -> usize {
        let event = Arc::new(event);
        recipients
            .iter()
            .filter(|conn| self.deliver(registry, conn, &event))
            .count()
    }

    /// Queue an event for every member of a room.
    pub fn to_room(
        &self,
        registry: &ConnectionRegistry,
        rooms: &RoomManager,
        project: &str,
        event: ServerEvent,
    ) -> usize {
        self.send_to_all(registry, &rooms.members(project), event)
    }

    /// Change broadcaster: deliver a committed domain mutation to every
    /// member of the project room. The payload is not inspected.
    pub fn publish(
        &self,
        registry: &ConnectionRegistry,
        rooms: &RoomManager,
        project: &str,
        change: ChangeEvent,
    ) -> usize {
        self.changes_published.fetch_add(1, Ordering::Relaxed);
        let entity = change.entity;
        let kind = change.kind;
        let delivered = self.to_room(registry, rooms, project, ServerEvent::from_change(change));
        log::debug!("Published {kind:?} {entity:?} to {delivered} members of room {project}");
        delivered
    }

    fn deliver(&self, registry: &ConnectionRegistry, conn: &ConnectionId, event: &Arc<ServerEvent>) -> bool {
        match registry.deliver(conn, event) {
            Delivery::Queued => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Delivery::Full => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Outbound queue full for connection {conn}; event dropped");
                false
            }
            Delivery::Closed | Delivery::Unknown => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Connection {conn} gone; event dropped");
                false
            }
        }
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            changes_published: self.changes_published.load(Ordering::Relaxed),
        }
    }
}
