//! # tandem-collab: Real-time collaboration layer for project workspaces
//!
//! Presence, edit claims, typing indicators and change fan-out over
//! WebSocket. State is session-scoped and lives in memory only.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket / JSON   ┌──────────────┐
//! │ CollabClient │ ◄───────────────────► │ CollabServer │
//! │ (per user)   │                       │ (task/conn)  │
//! └──────┬───────┘                       └──────┬───────┘
//!        │                                      │ handle(ClientEvent)
//!        ▼                                      ▼
//! ┌──────────────┐                       ┌──────────────┐    publish()
//! │ LocalView    │                       │  CollabHub   │ ◄── domain services
//! │ Reconnection │                       │  (one lock)  │
//! └──────────────┘                       └──────┬───────┘
//!                          ┌──────────┬─────────┼─────────┬──────────┐
//!                          ▼          ▼         ▼         ▼          ▼
//!                      Registry    Rooms    Presence   Locks     Typing
//!                                               │
//!                                        ┌──────┴──────┐
//!                                        │   Fanout    │ (bounded queue
//!                                        │             │  per connection)
//!                                        └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events and identifier types
//! - [`registry`]: Live connections and their outbound queues
//! - [`rooms`]: Project rooms and their member connections
//! - [`presence`]: Distinct users per room, change detection
//! - [`locks`]: Exclusive per-task edit claims
//! - [`typing`]: Typing indicators with expiry
//! - [`broadcast`]: Fire-and-forget fan-out with stats
//! - [`hub`]: The coordinating service and periodic sweep
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with reconnection and local view
//! - [`reconnect`]: Backoff policy and connection state machine

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod hub;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod rooms;
pub mod server;
pub mod typing;
pub mod view;

// Re-exports for convenience
pub use auth::{Authenticator, StaticTokens};
pub use broadcast::{BroadcastStats, Fanout};
pub use client::{ClientError, CollabClient, CollabEvent};
pub use config::{ConfigError, ServerConfig};
pub use hub::{spawn_sweeper, CollabHub, SweepReport};
pub use locks::{ClaimOutcome, EditClaim, EditLockManager};
pub use presence::{PresenceChange, PresenceTracker};
pub use protocol::{
    ActivityNotice, Actor, ChangeEvent, ChangeKind, ClientEvent, ConnectionId, EntityId,
    EntityKind, ErrorCode, ProjectId, ProtocolError, RoomRef, ServerEvent, TaskRef, UserId,
    UserInfo,
};
pub use reconnect::{ConnectionState, ReconnectPolicy, ReconnectionController};
pub use registry::{Connection, ConnectionRegistry, Delivery, Outbound, RegistryError};
pub use rooms::{Membership, RoomManager};
pub use server::{CollabServer, ServerError, ServerStats};
pub use typing::{TypingAggregator, TypingEntry};
pub use view::LocalView;
