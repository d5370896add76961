//! JSON event protocol spoken between collaboration clients and the server.
//!
//! Every WebSocket text frame carries one event envelope:
//! ```text
//! { "event": "<kebab-case name>", "data": { ...camelCase fields } }
//! ```
//!
//! [`ClientEvent`] is the client → server catalog, [`ServerEvent`] the
//! server → client one. Both are closed enums so the hub dispatches them
//! through a single exhaustive `match`.
//!
//! User, project and entity ids are opaque strings owned by the external
//! domain store. Numeric ids are accepted on the wire and normalised to
//! their decimal form, so `taskId: 7` and `taskId: "7"` name the same task.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Server-assigned id of one transport connection.
pub type ConnectionId = Uuid;
/// Id of an authenticated user, as issued by the auth collaborator.
pub type UserId = String;
/// Id of a project; doubles as the broadcast room key.
pub type ProjectId = String;
/// Id of an editable entity (a task).
pub type EntityId = String;

/// Presence view of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// `#rrggbb`, stable for a given id.
    pub color: String,
}

impl UserInfo {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        let id = id.into();
        let color = display_color(&id);
        Self {
            id,
            name: name.into(),
            avatar: None,
            color,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

/// Derive a vivid, stable display color from a user id.
///
/// The hue comes from an FNV-1a hash of the id so every client renders the
/// same user with the same color, independent of process or platform.
pub fn display_color(id: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in id.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let hue = (hash % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Accept either a JSON string or a JSON number as an id.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

/// Payload addressing a project room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    #[serde(deserialize_with = "id_string")]
    pub project_id: ProjectId,
}

impl RoomRef {
    pub fn new(project_id: impl Into<ProjectId>) -> Self {
        Self { project_id: project_id.into() }
    }
}

/// Payload addressing a task inside a project room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    #[serde(deserialize_with = "id_string")]
    pub project_id: ProjectId,
    #[serde(deserialize_with = "id_string")]
    pub task_id: EntityId,
}

impl TaskRef {
    pub fn new(project_id: impl Into<ProjectId>, task_id: impl Into<EntityId>) -> Self {
        Self {
            project_id: project_id.into(),
            task_id: task_id.into(),
        }
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Bind an identity to this connection. Must precede any room action.
    Authenticate { token: String },
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    EditClaimStart(TaskRef),
    EditClaimStop(TaskRef),
    TypingStart(TaskRef),
    TypingStop(TaskRef),
    /// Application-level keep-alive for clients without control frames.
    Ping {},
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Project the event is scoped to, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            ClientEvent::JoinRoom(r) | ClientEvent::LeaveRoom(r) => Some(&r.project_id),
            ClientEvent::EditClaimStart(t)
            | ClientEvent::EditClaimStop(t)
            | ClientEvent::TypingStart(t)
            | ClientEvent::TypingStop(t) => Some(&t.project_id),
            ClientEvent::Authenticate { .. } | ClientEvent::Ping {} => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// Kind of domain mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Kind of domain entity a change refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Task,
    Section,
    Block,
}

/// Who performed a domain mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub name: String,
}

impl From<&UserInfo> for Actor {
    fn from(user: &UserInfo) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
        }
    }
}

/// A committed domain mutation, transported as-is to room members.
///
/// `fields` holds the entity's own fields and is flattened into the
/// payload next to `type` and `actor`. The entity kind is carried by the
/// event name (`task-changed`, ...), not by the payload.
///
/// Entity fields named `type` or `actor` are stored as `entityType` and
/// `entityActor` by [`ChangeEvent::with_field`]. Reserved keys inserted
/// into `fields` directly are not serialized; the envelope's own value wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(skip)]
    pub entity: EntityKind,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(flatten, serialize_with = "entity_fields")]
    pub fields: Map<String, Value>,
}

/// Payload keys owned by the change envelope, with the name an entity
/// field of the same name is carried under.
const RESERVED_FIELDS: [(&str, &str); 2] = [("type", "entityType"), ("actor", "entityActor")];

fn reserved_alias(key: &str) -> Option<&'static str> {
    RESERVED_FIELDS
        .iter()
        .find(|(reserved, _)| *reserved == key)
        .map(|(_, alias)| *alias)
}

fn entity_fields<S>(fields: &Map<String, Value>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(fields.iter().filter(|(key, _)| reserved_alias(key).is_none()))
}

impl ChangeEvent {
    pub fn new(entity: EntityKind, kind: ChangeKind) -> Self {
        Self {
            entity,
            kind,
            actor: None,
            fields: Map::new(),
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut key = key.into();
        if let Some(alias) = reserved_alias(&key) {
            key = alias.to_string();
        }
        self.fields.insert(key, value.into());
        self
    }
}

/// `{ taskId, userId, userName }`, shared by claim and typing notices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityNotice {
    #[serde(deserialize_with = "id_string")]
    pub task_id: EntityId,
    #[serde(deserialize_with = "id_string")]
    pub user_id: UserId,
    pub user_name: String,
}

impl ActivityNotice {
    pub fn new(
        task_id: impl Into<EntityId>,
        user_id: impl Into<UserId>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }
}

/// Machine-readable reason attached to an `error` acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Room action on a connection with no bound identity.
    Unauthenticated,
    /// The auth collaborator rejected the credential.
    InvalidCredentials,
    /// A second `authenticate` on an already bound connection.
    AlreadyAuthenticated,
    /// The user is not a member of the project.
    Forbidden,
    /// Entity action in a room this connection has not joined.
    NotInRoom,
    /// Frame could not be decoded.
    BadRequest,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Authenticated {
        #[serde(deserialize_with = "id_string")]
        user_id: UserId,
    },
    /// Full presence snapshot of a room; consumers key by user id.
    PresenceUpdate {
        #[serde(deserialize_with = "id_string")]
        project_id: ProjectId,
        users: Vec<UserInfo>,
    },
    TaskChanged(ChangeEvent),
    SectionChanged(ChangeEvent),
    BlockChanged(ChangeEvent),
    EditClaimStarted(ActivityNotice),
    EditClaimStopped(ActivityNotice),
    /// Sent only to the requester of a denied claim.
    EditClaimConflict {
        #[serde(deserialize_with = "id_string")]
        task_id: EntityId,
        editing_by: String,
    },
    TypingStarted(ActivityNotice),
    TypingStopped(ActivityNotice),
    Pong {},
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerEvent {
    /// Wrap a change in the event named after its entity kind.
    pub fn from_change(change: ChangeEvent) -> Self {
        match change.entity {
            EntityKind::Task => ServerEvent::TaskChanged(change),
            EntityKind::Section => ServerEvent::SectionChanged(change),
            EntityKind::Block => ServerEvent::BlockChanged(change),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut event: ServerEvent = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        // The entity kind travels in the event name.
        match &mut event {
            ServerEvent::TaskChanged(c) => c.entity = EntityKind::Task,
            ServerEvent::SectionChanged(c) => c.entity = EntityKind::Section,
            ServerEvent::BlockChanged(c) => c.entity = EntityKind::Block,
            _ => {}
        }
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(&'static str),
    #[error("Connection closed")]
    ConnectionClosed,
}
