//! WebSocket server: one task per connection in front of the hub.
//!
//! ```text
//! Client A ──┐                         ┌── outbound queue A ──► Client A
//!             ├── handle(ClientEvent) ──► CollabHub
//! Client B ──┘                         └── outbound queue B ──► Client B
//! ```
//!
//! Each connection task multiplexes three sources with `select!`: inbound
//! frames, its outbound queue, and a heartbeat ticker. A slow socket only
//! ever stalls its own task; the hub never waits on it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::auth::Authenticator;
use crate::config::{ConfigError, ServerConfig};
use crate::hub::{spawn_sweeper, CollabHub};
use crate::protocol::{ClientEvent, ErrorCode, ProtocolError};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_frames: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    rejected_frames: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("WebSocket handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    /// Create a server with a fresh hub.
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Result<Self, ServerError> {
        config.validate()?;
        let hub = Arc::new(CollabHub::new(config.clone(), auth));
        Ok(Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// The hub, for domain collaborators (`publish`, `viewers`, `editor_of`).
    pub fn hub(&self) -> Arc<CollabHub> {
        self.hub.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        let sweeper = spawn_sweeper(&self.hub, self.config.sweep_interval);

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::Io(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    /// Handle a single WebSocket connection. The handshake must complete
    /// within one heartbeat interval.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<CollabHub>,
        stats: Arc<AtomicServerStats>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let handshake = tokio_tungstenite::accept_async(stream);
        let ws_stream = tokio::time::timeout(config.heartbeat_interval, handshake)
            .await
            .map_err(|_| ServerError::HandshakeTimeout(config.heartbeat_interval))??;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (conn, mut outbound) = hub.connect().await;
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {conn} established from {addr}");

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let result: Result<(), ServerError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                match ClientEvent::decode(text.as_str()) {
                                    Ok(event) => {
                                        let scope = event.project_id().unwrap_or("-");
                                        log::trace!("{conn} [{scope}] → {event:?}");
                                        hub.handle(conn, event).await;
                                    }
                                    Err(e) => {
                                        stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        hub.reject(conn, ErrorCode::BadRequest, e.to_string()).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                let e = ProtocolError::UnsupportedFrame("binary");
                                log::warn!("Rejected frame from {addr}: {e}");
                                hub.reject(conn, ErrorCode::BadRequest, e.to_string()).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                hub.touch(conn).await;
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Pong(_))) => {
                                hub.touch(conn).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        }
                    }

                    event = outbound.recv() => {
                        match event {
                            Some(event) => match event.encode() {
                                Ok(text) => ws_sender.send(Message::Text(text.into())).await?,
                                Err(e) => log::error!("Failed to encode event for {conn}: {e}"),
                            },
                            None => {
                                // The hub dropped us (idle sweep).
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        hub.disconnect(conn).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            rejected_frames: self.stats.rejected_frames.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokens;
    use std::time::Duration;

    #[test]
    fn test_server_creation() {
        let server = CollabServer::new(ServerConfig::default(), Arc::new(StaticTokens::new())).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig {
            sweep_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        let result = CollabServer::new(config, Arc::new(StaticTokens::new()));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_hub_shared_with_collaborators() {
        let server = CollabServer::new(ServerConfig::default(), Arc::new(StaticTokens::new())).unwrap();
        let hub = server.hub();
        assert!(Arc::ptr_eq(&hub, &server.hub()));
        assert_eq!(hub.connection_count().await, 0);
        assert!(hub.viewers("p").await.is_empty());
    }
}
