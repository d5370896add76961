//! The collaboration hub: one coordinating service owning every table.
//!
//! ```text
//!   transport task ──► CollabHub::handle(conn, ClientEvent)
//!                           │   (one async mutex)
//!        ┌──────────────────┼──────────────────┬──────────────┐
//!        ▼                  ▼                  ▼              ▼
//!  ConnectionRegistry   RoomManager ──► PresenceTracker  EditLockManager
//!        │                                                TypingAggregator
//!        ▼
//!   Fanout (try_send per recipient) ──► outbound queues ──► transport tasks
//! ```
//!
//! All state changes happen under a single lock, which serialises
//! concurrent join/leave/claim/typing requests and keeps the single-holder
//! invariant trivially true. Nothing under the lock awaits I/O: outbound
//! delivery only enqueues.
//!
//! Domain collaborators use [`CollabHub::publish`] after committing a
//! mutation, and the read-only queries [`CollabHub::viewers`] and
//! [`CollabHub::editor_of`]. None of these can fail.

use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::auth::Authenticator;
use crate::broadcast::{BroadcastStats, Fanout};
use crate::config::ServerConfig;
use crate::locks::{ClaimOutcome, EditClaim, EditLockManager};
use crate::presence::PresenceTracker;
use crate::protocol::{
    ActivityNotice, ChangeEvent, ClientEvent, ConnectionId, ErrorCode, ProjectId, ServerEvent,
    TaskRef, UserInfo,
};
use crate::registry::{ConnectionRegistry, Outbound, RegistryError};
use crate::rooms::{Membership, RoomManager};
use crate::typing::{TypingAggregator, TypingEntry};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub typing_expired: usize,
    pub claims_expired: usize,
    pub connections_dropped: usize,
}

pub struct CollabHub {
    state: Mutex<HubState>,
    auth: Arc<dyn Authenticator>,
    fanout: Fanout,
    config: ServerConfig,
}

struct HubState {
    registry: ConnectionRegistry,
    rooms: RoomManager,
    presence: PresenceTracker,
    locks: EditLockManager,
    typing: TypingAggregator,
}

fn claim_notice(claim: &EditClaim) -> ActivityNotice {
    ActivityNotice::new(&claim.entity_id, &claim.holder, &claim.holder_name)
}

fn typing_notice(entry: &TypingEntry) -> ActivityNotice {
    ActivityNotice::new(&entry.entity_id, &entry.user_id, &entry.user_name)
}

impl CollabHub {
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Self {
        let state = HubState {
            registry: ConnectionRegistry::new(config.outbound_capacity),
            rooms: RoomManager::new(),
            presence: PresenceTracker::new(),
            locks: EditLockManager::new(config.claim_ttl),
            typing: TypingAggregator::new(config.typing_ttl),
        };
        Self {
            state: Mutex::new(state),
            auth,
            fanout: Fanout::new(),
            config,
        }
    }

    /// Admit a new transport connection. The returned queue carries every
    /// event addressed to it; it closes when the connection is dropped.
    pub async fn connect(&self) -> (ConnectionId, Outbound) {
        let mut state = self.state.lock().await;
        let (id, outbound) = state.registry.admit(Instant::now());
        log::debug!("Connection {id} admitted ({} live)", state.registry.len());
        (id, outbound)
    }

    /// Single entry point for client events.
    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) {
        // Credential checks go to the collaborator outside the lock.
        let resolved = match &event {
            ClientEvent::Authenticate { token } => Some(self.auth.authenticate(token)),
            _ => None,
        };

        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.registry.touch(&conn, now);
        let fanout = &self.fanout;

        match event {
            ClientEvent::Authenticate { .. } => {
                state.authenticate(fanout, conn, resolved.flatten());
            }
            ClientEvent::JoinRoom(room) => {
                state.join(fanout, self.auth.as_ref(), conn, &room.project_id);
            }
            ClientEvent::LeaveRoom(room) => {
                if state.require_user(fanout, conn).is_some() {
                    state.leave(fanout, conn, &room.project_id);
                }
            }
            ClientEvent::EditClaimStart(task) => state.claim_start(fanout, conn, &task, now),
            ClientEvent::EditClaimStop(task) => state.claim_stop(fanout, conn, &task),
            ClientEvent::TypingStart(task) => state.typing_start(fanout, conn, &task, now),
            ClientEvent::TypingStop(task) => state.typing_stop(fanout, conn, &task),
            ClientEvent::Ping {} => {
                fanout.send_to(&state.registry, &conn, ServerEvent::Pong {});
            }
        }
    }

    /// Send an error acknowledgement to one connection.
    pub async fn reject(&self, conn: ConnectionId, code: ErrorCode, message: impl Into<String>) {
        let state = self.state.lock().await;
        self.fanout
            .send_to(&state.registry, &conn, ServerEvent::error(code, message));
    }

    /// Record transport-level activity (heartbeat replies).
    pub async fn touch(&self, conn: ConnectionId) {
        self.state.lock().await.registry.touch(&conn, Instant::now());
    }

    /// Drop a connection and clean up everything tied to it.
    ///
    /// Leaves every joined room; if it was the user's last connection, also
    /// releases their claims and typing entries. Returns `false` if the
    /// connection was already gone.
    pub async fn disconnect(&self, conn: ConnectionId) -> bool {
        self.state.lock().await.drop_connection(&self.fanout, conn)
    }

    /// Change broadcaster: deliver a committed domain mutation to the room.
    pub async fn publish(&self, project: &str, change: ChangeEvent) -> usize {
        let state = self.state.lock().await;
        self.fanout
            .publish(&state.registry, &state.rooms, project, change)
    }

    /// Who is viewing `project`.
    pub async fn viewers(&self, project: &str) -> Vec<UserInfo> {
        let state = self.state.lock().await;
        state.presence.snapshot(project, &state.rooms, &state.registry)
    }

    /// Who is editing `entity`.
    pub async fn editor_of(&self, entity: &str) -> Option<EditClaim> {
        self.state.lock().await.locks.holder(entity).cloned()
    }

    /// Expire typing entries and idle claims, and drop silent connections.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let fanout = &self.fanout;
        let mut report = SweepReport::default();

        for entry in state.typing.expire(now) {
            fanout.to_room(
                &state.registry,
                &state.rooms,
                &entry.project_id,
                ServerEvent::TypingStopped(typing_notice(&entry)),
            );
            report.typing_expired += 1;
        }

        for claim in state.locks.expire(now) {
            fanout.to_room(
                &state.registry,
                &state.rooms,
                &claim.project_id,
                ServerEvent::EditClaimStopped(claim_notice(&claim)),
            );
            report.claims_expired += 1;
        }

        for conn in state.registry.stale(now, self.config.idle_timeout) {
            log::info!("Connection {conn} idle past {:?}; dropping", self.config.idle_timeout);
            if state.drop_connection(fanout, conn) {
                report.connections_dropped += 1;
            }
        }

        report
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.registry.ids()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.registry.len()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.room_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.fanout.stats()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Run [`CollabHub::sweep`] every `interval` until the hub is dropped.
pub fn spawn_sweeper(hub: &Arc<CollabHub>, interval: Duration) -> JoinHandle<()> {
    let hub: Weak<CollabHub> = Arc::downgrade(hub);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(hub) = hub.upgrade() else { break };
            let report = hub.sweep().await;
            if report != SweepReport::default() {
                log::debug!("Sweep: {report:?}");
            }
        }
    })
}

impl HubState {
    fn authenticate(&mut self, fanout: &Fanout, conn: ConnectionId, user: Option<UserInfo>) {
        let Some(user) = user else {
            log::warn!("Connection {conn} presented an invalid credential");
            fanout.send_to(
                &self.registry,
                &conn,
                ServerEvent::error(ErrorCode::InvalidCredentials, "credential rejected"),
            );
            return;
        };

        match self.registry.bind_identity(conn, user.clone()) {
            Ok(()) => {
                log::info!("Connection {conn} authenticated as {} ({})", user.name, user.id);
                fanout.send_to(
                    &self.registry,
                    &conn,
                    ServerEvent::Authenticated { user_id: user.id },
                );
            }
            Err(RegistryError::AlreadyBound(_, existing)) => {
                fanout.send_to(
                    &self.registry,
                    &conn,
                    ServerEvent::error(
                        ErrorCode::AlreadyAuthenticated,
                        format!("connection is bound to {existing}"),
                    ),
                );
            }
            Err(RegistryError::UnknownConnection(_)) => {
                log::debug!("Authenticate for dropped connection {conn}");
            }
        }
    }

    /// The connection's identity, or an `unauthenticated` error to it.
    fn require_user(&self, fanout: &Fanout, conn: ConnectionId) -> Option<UserInfo> {
        let user = self.registry.user_of(&conn).cloned();
        if user.is_none() {
            fanout.send_to(
                &self.registry,
                &conn,
                ServerEvent::error(ErrorCode::Unauthenticated, "authenticate before room actions"),
            );
        }
        user
    }

    /// Identity of a connection that has joined `project`.
    fn require_room(&self, fanout: &Fanout, conn: ConnectionId, project: &str) -> Option<UserInfo> {
        let user = self.require_user(fanout, conn)?;
        if !self.rooms.is_member(&conn, project) {
            fanout.send_to(
                &self.registry,
                &conn,
                ServerEvent::error(ErrorCode::NotInRoom, format!("join project {project} first")),
            );
            return None;
        }
        Some(user)
    }

    fn join(&mut self, fanout: &Fanout, auth: &dyn Authenticator, conn: ConnectionId, project: &str) {
        let Some(user) = self.require_user(fanout, conn) else { return };

        if !auth.can_access(&user, project) {
            log::warn!("{} denied access to project {project}", user.id);
            fanout.send_to(
                &self.registry,
                &conn,
                ServerEvent::error(ErrorCode::Forbidden, format!("no access to project {project}")),
            );
            return;
        }

        if self.rooms.join(conn, project) == Membership::Unchanged {
            return;
        }
        self.registry.add_room(&conn, project);
        log::info!("{} joined room {project}", user.name);

        // Membership first, then presence: the joiner sees itself.
        let change = self.presence.recompute(project, &self.rooms, &self.registry);
        fanout.to_room(
            &self.registry,
            &self.rooms,
            project,
            ServerEvent::PresenceUpdate {
                project_id: project.to_string(),
                users: change.users,
            },
        );

        // Current claims and typists, so a (re)joining client starts from
        // server truth rather than whatever it cached.
        let mut snapshot: Vec<ServerEvent> = self
            .locks
            .claims_in(project)
            .into_iter()
            .map(|c| ServerEvent::EditClaimStarted(claim_notice(c)))
            .collect();
        snapshot.extend(
            self.typing
                .typing_in(project)
                .into_iter()
                .map(|e| ServerEvent::TypingStarted(typing_notice(e))),
        );
        for event in snapshot {
            fanout.send_to(&self.registry, &conn, event);
        }
    }

    fn leave(&mut self, fanout: &Fanout, conn: ConnectionId, project: &str) {
        if self.rooms.leave(&conn, project) == Membership::Unchanged {
            return;
        }
        self.registry.remove_room(&conn, project);
        log::debug!("Connection {conn} left room {project}");
        self.announce_if_changed(fanout, project);
    }

    fn announce_if_changed(&mut self, fanout: &Fanout, project: &str) {
        let change = self.presence.recompute(project, &self.rooms, &self.registry);
        if change.changed && !change.users.is_empty() {
            fanout.to_room(
                &self.registry,
                &self.rooms,
                project,
                ServerEvent::PresenceUpdate {
                    project_id: project.to_string(),
                    users: change.users,
                },
            );
        }
    }

    fn claim_start(&mut self, fanout: &Fanout, conn: ConnectionId, task: &TaskRef, now: Instant) {
        let Some(user) = self.require_room(fanout, conn, &task.project_id) else { return };

        match self.locks.request_claim(&task.project_id, &task.task_id, &user, now) {
            ClaimOutcome::Acquired(claim) => {
                fanout.to_room(
                    &self.registry,
                    &self.rooms,
                    &claim.project_id,
                    ServerEvent::EditClaimStarted(claim_notice(&claim)),
                );
            }
            ClaimOutcome::Refreshed(claim) => {
                // Duplicate request: acknowledge to the requester only.
                fanout.send_to(
                    &self.registry,
                    &conn,
                    ServerEvent::EditClaimStarted(claim_notice(&claim)),
                );
            }
            ClaimOutcome::Conflict(claim) => {
                log::debug!(
                    "{} denied claim on {}: held by {}",
                    user.name,
                    task.task_id,
                    claim.holder_name
                );
                fanout.send_to(
                    &self.registry,
                    &conn,
                    ServerEvent::EditClaimConflict {
                        task_id: task.task_id.clone(),
                        editing_by: claim.holder_name,
                    },
                );
            }
        }
    }

    fn claim_stop(&mut self, fanout: &Fanout, conn: ConnectionId, task: &TaskRef) {
        let Some(user) = self.require_user(fanout, conn) else { return };
        if let Some(claim) = self.locks.release_claim(&task.task_id, &user.id) {
            fanout.to_room(
                &self.registry,
                &self.rooms,
                &claim.project_id,
                ServerEvent::EditClaimStopped(claim_notice(&claim)),
            );
        }
    }

    fn typing_start(&mut self, fanout: &Fanout, conn: ConnectionId, task: &TaskRef, now: Instant) {
        let Some(user) = self.require_room(fanout, conn, &task.project_id) else { return };

        if self
            .typing
            .start(&task.project_id, &task.task_id, &user.id, &user.name, now)
        {
            log::trace!("{} typing on {}", user.name, task.task_id);
        }
        self.locks.touch(&task.task_id, &user.id, now);
        fanout.to_room(
            &self.registry,
            &self.rooms,
            &task.project_id,
            ServerEvent::TypingStarted(ActivityNotice::new(&task.task_id, &user.id, &user.name)),
        );
    }

    fn typing_stop(&mut self, fanout: &Fanout, conn: ConnectionId, task: &TaskRef) {
        let Some(user) = self.require_user(fanout, conn) else { return };
        if let Some(entry) = self.typing.stop(&task.task_id, &user.id) {
            fanout.to_room(
                &self.registry,
                &self.rooms,
                &entry.project_id,
                ServerEvent::TypingStopped(typing_notice(&entry)),
            );
        }
    }

    fn drop_connection(&mut self, fanout: &Fanout, conn: ConnectionId) -> bool {
        let Some(dropped) = self.registry.remove(&conn) else {
            return false;
        };

        let rooms: Vec<ProjectId> = dropped.rooms.iter().cloned().collect();
        for project in &rooms {
            self.rooms.leave(&conn, project);
        }

        if let Some(user) = &dropped.user {
            if self.registry.connections_of(&user.id) == 0 {
                for claim in self.locks.release_all_held_by(&user.id) {
                    log::info!(
                        "Released claim on {} held by disconnected {}",
                        claim.entity_id,
                        user.name
                    );
                    fanout.to_room(
                        &self.registry,
                        &self.rooms,
                        &claim.project_id,
                        ServerEvent::EditClaimStopped(claim_notice(&claim)),
                    );
                }
                for entry in self.typing.remove_user(&user.id) {
                    fanout.to_room(
                        &self.registry,
                        &self.rooms,
                        &entry.project_id,
                        ServerEvent::TypingStopped(typing_notice(&entry)),
                    );
                }
            }
        }

        for project in &rooms {
            self.announce_if_changed(fanout, project);
        }

        log::info!(
            "Connection {conn} dropped ({} live, {} rooms)",
            self.registry.len(),
            self.rooms.room_count()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use crate::protocol::{ChangeKind, EntityKind, RoomRef};

    fn hub_with(config: ServerConfig) -> CollabHub {
        let auth = StaticTokens::new()
            .with_user("t-a", UserInfo::new("a", "Alice"))
            .with_user("t-b", UserInfo::new("b", "Bob"))
            .with_user("t-c", UserInfo::new("c", "Carol"))
            .with_membership("c", "p")
            .with_membership("c", "other");
        CollabHub::new(config, Arc::new(auth))
    }

    fn hub() -> CollabHub {
        hub_with(ServerConfig::default())
    }

    fn drain(rx: &mut Outbound) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push((*ev).clone());
        }
        out
    }

    async fn login(hub: &CollabHub, token: &str) -> (ConnectionId, Outbound) {
        let (conn, mut rx) = hub.connect().await;
        hub.handle(conn, ClientEvent::Authenticate { token: token.into() }).await;
        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::Authenticated { .. }]));
        (conn, rx)
    }

    async fn join(hub: &CollabHub, conn: ConnectionId, project: &str) {
        hub.handle(conn, ClientEvent::JoinRoom(RoomRef::new(project))).await;
    }

    fn presence_ids(events: &[ServerEvent]) -> Vec<Vec<String>> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::PresenceUpdate { users, .. } => {
                    let mut ids: Vec<String> = users.iter().map(|u| u.id.clone()).collect();
                    ids.sort();
                    Some(ids)
                }
                _ => None,
            })
            .collect()
    }

    fn claim(project: &str, task: &str) -> ClientEvent {
        ClientEvent::EditClaimStart(TaskRef::new(project, task))
    }

    #[tokio::test]
    async fn test_join_presence_scenario() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        join(&hub, a, "p").await;
        assert_eq!(presence_ids(&drain(&mut rx_a)), vec![vec!["a".to_string()]]);

        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, b, "p").await;
        let both = vec![vec!["a".to_string(), "b".to_string()]];
        assert_eq!(presence_ids(&drain(&mut rx_a)), both);
        assert_eq!(presence_ids(&drain(&mut rx_b)), both);
    }

    #[tokio::test]
    async fn test_second_tab_does_not_duplicate_presence() {
        let hub = hub();
        let (a1, _rx1) = login(&hub, "t-a").await;
        let (a2, mut rx2) = login(&hub, "t-a").await;
        join(&hub, a1, "p").await;
        join(&hub, a2, "p").await;

        assert_eq!(presence_ids(&drain(&mut rx2)), vec![vec!["a".to_string()]]);
        assert_eq!(hub.viewers("p").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_room_actions_rejected() {
        let hub = hub();
        let (anon, mut rx) = hub.connect().await;
        let (a, mut rx_a) = login(&hub, "t-a").await;
        join(&hub, a, "p").await;
        drain(&mut rx_a);

        join(&hub, anon, "p").await;
        hub.handle(anon, claim("p", "7")).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e,
            ServerEvent::Error { code: ErrorCode::Unauthenticated, .. }
        )));
        // Other members hear nothing.
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_and_repeated_credentials() {
        let hub = hub();
        let (conn, mut rx) = hub.connect().await;
        hub.handle(conn, ClientEvent::Authenticate { token: "nope".into() }).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::Error { code: ErrorCode::InvalidCredentials, .. }]
        ));

        hub.handle(conn, ClientEvent::Authenticate { token: "t-a".into() }).await;
        hub.handle(conn, ClientEvent::Authenticate { token: "t-b".into() }).await;
        let events = drain(&mut rx);
        assert!(matches!(events[0], ServerEvent::Authenticated { .. }));
        assert!(matches!(
            events[1],
            ServerEvent::Error { code: ErrorCode::AlreadyAuthenticated, .. }
        ));
    }

    #[tokio::test]
    async fn test_membership_enforced_on_join() {
        let hub = hub();
        let (c, mut rx) = login(&hub, "t-c").await;
        join(&hub, c, "secret").await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::Error { code: ErrorCode::Forbidden, .. }]
        ));
        assert_eq!(hub.room_count().await, 0);

        join(&hub, c, "p").await;
        assert_eq!(presence_ids(&drain(&mut rx)).len(), 1);
    }

    #[tokio::test]
    async fn test_claim_conflict_scenario() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, b, "p").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(a, claim("p", "7")).await;
        let started = ServerEvent::EditClaimStarted(ActivityNotice::new("7", "a", "Alice"));
        assert_eq!(drain(&mut rx_a), vec![started.clone()]);
        assert_eq!(drain(&mut rx_b), vec![started]);

        hub.handle(b, claim("p", "7")).await;
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::EditClaimConflict {
                task_id: "7".into(),
                editing_by: "Alice".into()
            }]
        );
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(hub.editor_of("7").await.unwrap().holder, "a");
    }

    #[tokio::test]
    async fn test_duplicate_claim_acknowledged_privately() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, b, "p").await;
        hub.handle(a, claim("p", "7")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(a, claim("p", "7")).await;
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_claim_requires_joined_room() {
        let hub = hub();
        let (a, mut rx) = login(&hub, "t-a").await;
        hub.handle(a, claim("p", "7")).await;
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::Error { code: ErrorCode::NotInRoom, .. }]
        ));
        assert!(hub.editor_of("7").await.is_none());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_silent() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, b, "p").await;
        hub.handle(a, claim("p", "7")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(b, ClientEvent::EditClaimStop(TaskRef::new("p", "7"))).await;
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert!(hub.editor_of("7").await.is_some());

        hub.handle(a, ClientEvent::EditClaimStop(TaskRef::new("p", "7"))).await;
        let stopped = ServerEvent::EditClaimStopped(ActivityNotice::new("7", "a", "Alice"));
        assert_eq!(drain(&mut rx_b), vec![stopped]);
        assert!(hub.editor_of("7").await.is_none());
    }

    #[tokio::test]
    async fn test_drop_frees_claim_scenario() {
        let hub = hub();
        let (a, _rx_a) = login(&hub, "t-a").await;
        let (c, mut rx_c) = login(&hub, "t-c").await;
        join(&hub, a, "p").await;
        join(&hub, c, "p").await;
        hub.handle(a, claim("p", "7")).await;
        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("p", "7"))).await;
        drain(&mut rx_c);

        assert!(hub.disconnect(a).await);
        let events = drain(&mut rx_c);
        assert!(events.contains(&ServerEvent::EditClaimStopped(ActivityNotice::new("7", "a", "Alice"))));
        assert!(events.contains(&ServerEvent::TypingStopped(ActivityNotice::new("7", "a", "Alice"))));
        assert_eq!(presence_ids(&events), vec![vec!["c".to_string()]]);

        hub.handle(c, claim("p", "7")).await;
        assert_eq!(
            drain(&mut rx_c),
            vec![ServerEvent::EditClaimStarted(ActivityNotice::new("7", "c", "Carol"))]
        );
        assert!(!hub.disconnect(a).await);
    }

    #[tokio::test]
    async fn test_claim_survives_while_other_tab_lives() {
        let hub = hub();
        let (a1, _rx1) = login(&hub, "t-a").await;
        let (a2, _rx2) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        for conn in [a1, a2, b] {
            join(&hub, conn, "p").await;
        }
        hub.handle(a1, claim("p", "7")).await;
        drain(&mut rx_b);

        hub.disconnect(a1).await;
        assert!(drain(&mut rx_b).is_empty(), "no claim release, no presence change");
        assert_eq!(hub.editor_of("7").await.unwrap().holder, "a");

        hub.disconnect(a2).await;
        assert!(hub.editor_of("7").await.is_none());
    }

    #[tokio::test]
    async fn test_leave_keeps_locks() {
        let hub = hub();
        let (a, _rx) = login(&hub, "t-a").await;
        join(&hub, a, "p").await;
        hub.handle(a, claim("p", "7")).await;
        hub.handle(a, ClientEvent::LeaveRoom(RoomRef::new("p"))).await;

        assert_eq!(hub.room_count().await, 0);
        assert!(hub.editor_of("7").await.is_some());
        assert!(hub.viewers("p").await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_unjoined_room_is_silent() {
        let hub = hub();
        let (a, mut rx) = login(&hub, "t-a").await;
        hub.handle(a, ClientEvent::LeaveRoom(RoomRef::new("p"))).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_receives_existing_claims_and_typing() {
        let hub = hub();
        let (a, _rx_a) = login(&hub, "t-a").await;
        join(&hub, a, "p").await;
        hub.handle(a, claim("p", "7")).await;
        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("p", "8"))).await;

        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, b, "p").await;
        let events = drain(&mut rx_b);
        assert!(matches!(events[0], ServerEvent::PresenceUpdate { .. }));
        assert!(events.contains(&ServerEvent::EditClaimStarted(ActivityNotice::new("7", "a", "Alice"))));
        assert!(events.contains(&ServerEvent::TypingStarted(ActivityNotice::new("8", "a", "Alice"))));
    }

    #[tokio::test]
    async fn test_typing_stop_without_start_is_silent() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        join(&hub, a, "p").await;
        drain(&mut rx_a);

        hub.handle(a, ClientEvent::TypingStop(TaskRef::new("p", "7"))).await;
        assert!(drain(&mut rx_a).is_empty());

        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("p", "7"))).await;
        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("p", "7"))).await;
        hub.handle(a, ClientEvent::TypingStop(TaskRef::new("p", "7"))).await;
        let events = drain(&mut rx_a);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], ServerEvent::TypingStopped(_)));
    }

    #[tokio::test]
    async fn test_typing_stop_follows_latest_project() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, a, "q").await;
        join(&hub, b, "q").await;

        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("p", "7"))).await;
        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("q", "7"))).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(a, ClientEvent::TypingStop(TaskRef::new("q", "7"))).await;
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::TypingStopped(ActivityNotice::new("7", "a", "Alice"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_typing_once() {
        let hub = hub();
        let (a, _rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, b, "p").await;
        hub.handle(a, ClientEvent::TypingStart(TaskRef::new("p", "7"))).await;
        hub.handle(a, ClientEvent::Ping {}).await;
        hub.handle(b, ClientEvent::Ping {}).await;
        drain(&mut rx_b);

        tokio::time::advance(Duration::from_secs(9)).await;
        let report = hub.sweep().await;
        assert_eq!(report.typing_expired, 1);
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::TypingStopped(ActivityNotice::new("7", "a", "Alice"))]
        );

        assert_eq!(hub.sweep().await.typing_expired, 0);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_releases_idle_claim() {
        let config = ServerConfig {
            claim_ttl: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(3600),
            ..ServerConfig::default()
        };
        let hub = hub_with(config);
        let (a, _rx_a) = login(&hub, "t-a").await;
        join(&hub, a, "p").await;
        hub.handle(a, claim("p", "7")).await;

        tokio::time::advance(Duration::from_secs(200)).await;
        hub.handle(a, claim("p", "7")).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(hub.sweep().await.claims_expired, 0);

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(hub.sweep().await.claims_expired, 1);
        assert!(hub.editor_of("7").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_silent_connections() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, b, "p").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        tokio::time::advance(Duration::from_secs(45)).await;
        hub.touch(b).await;
        tokio::time::advance(Duration::from_secs(20)).await;

        let report = hub.sweep().await;
        assert_eq!(report.connections_dropped, 1);
        assert_eq!(presence_ids(&drain(&mut rx_b)), vec![vec!["b".to_string()]]);
        // A's queue is closed once its registry entry is gone.
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_room() {
        let hub = hub();
        let (a, mut rx_a) = login(&hub, "t-a").await;
        let (b, mut rx_b) = login(&hub, "t-b").await;
        join(&hub, a, "p").await;
        join(&hub, b, "elsewhere").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let change = ChangeEvent::new(EntityKind::Task, ChangeKind::Created).with_field("id", 7);
        assert_eq!(hub.publish("p", change.clone()).await, 1);
        assert_eq!(drain(&mut rx_a), vec![ServerEvent::TaskChanged(change)]);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(hub.stats().changes_published, 1);
    }

    #[tokio::test]
    async fn test_ping_needs_no_identity() {
        let hub = hub();
        let (conn, mut rx) = hub.connect().await;
        hub.handle(conn, ClientEvent::Ping {}).await;
        assert_eq!(drain(&mut rx), vec![ServerEvent::Pong {}]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_with_hub() {
        let hub = Arc::new(hub());
        let handle = spawn_sweeper(&hub, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(3)).await;
        drop(hub);
        tokio::time::advance(Duration::from_secs(2)).await;
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        const USERS: usize = 8;
        let mut auth = StaticTokens::new();
        for i in 0..USERS {
            let user = UserInfo::new(format!("u{i}"), format!("User{i}"));
            auth = auth.with_user(format!("t{i}"), user);
        }
        let hub = Arc::new(CollabHub::new(ServerConfig::default(), Arc::new(auth)));

        let mut peers = Vec::with_capacity(USERS);
        for i in 0..USERS {
            let (conn, rx) = login(&hub, &format!("t{i}")).await;
            join(&hub, conn, "p").await;
            peers.push((conn, rx));
        }
        for (_, rx) in peers.iter_mut() {
            drain(rx);
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(USERS));
        let handles: Vec<_> = peers
            .iter()
            .map(|(conn, _)| {
                let hub = hub.clone();
                let barrier = barrier.clone();
                let conn = *conn;
                tokio::spawn(async move {
                    barrier.wait().await;
                    hub.handle(conn, claim("p", "7")).await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let holder = hub.editor_of("7").await.unwrap().holder;
        let mut conflicts = 0;
        for (i, (_, rx)) in peers.iter_mut().enumerate() {
            let events = drain(rx);
            let started: Vec<_> = events
                .iter()
                .filter_map(|e| match e {
                    ServerEvent::EditClaimStarted(notice) => Some(notice.user_id.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(started, vec![holder.clone()]);

            let lost = events
                .iter()
                .filter(|e| matches!(e, ServerEvent::EditClaimConflict { .. }))
                .count();
            if format!("u{i}") == holder {
                assert_eq!(lost, 0);
            }
            conflicts += lost;
        }
        assert_eq!(conflicts, USERS - 1);
    }
}
