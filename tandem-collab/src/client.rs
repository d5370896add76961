//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - A supervised connection that reconnects with jittered exponential backoff
//! - Re-authentication and re-join of every remembered room after reconnect
//! - A [`LocalView`] of presence, edit claims and typing, cleared on disconnect
//! - Claim and typing requests for tasks

use std::sync::Arc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ConfigError;
use crate::protocol::{ClientEvent, ProtocolError, RoomRef, ServerEvent, TaskRef};
use crate::reconnect::{ConnectionState, ReconnectPolicy, ReconnectionController};
use crate::view::LocalView;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    StateChanged(ConnectionState),
    /// Every event received from the server, after it was applied to the view.
    Server(ServerEvent),
    /// The transport dropped and the local view was emptied.
    ViewCleared,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("client already started")]
    AlreadyStarted,
    #[error("invalid reconnect policy: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

struct Shared {
    controller: ReconnectionController,
    view: LocalView,
    /// Present only while a session is live.
    outgoing: Option<mpsc::Sender<ClientEvent>>,
}

/// The collaboration client.
pub struct CollabClient {
    server_url: String,
    token: String,
    shared: Arc<Mutex<Shared>>,
    retry: Arc<Notify>,
    event_tx: mpsc::Sender<CollabEvent>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
    supervisor: Option<JoinHandle<()>>,
}

impl CollabClient {
    pub fn new(
        server_url: impl Into<String>,
        token: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Self, ClientError> {
        let (event_tx, event_rx) = mpsc::channel(256);
        Ok(Self {
            server_url: server_url.into(),
            token: token.into(),
            shared: Arc::new(Mutex::new(Shared {
                controller: ReconnectionController::new(policy)?,
                view: LocalView::new(),
                outgoing: None,
            })),
            retry: Arc::new(Notify::new()),
            event_tx,
            event_rx: Some(event_rx),
            supervisor: None,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Start the connection supervisor. Returns immediately; progress is
    /// reported through [`CollabEvent::StateChanged`]. A failed first attempt
    /// goes through the same backoff as a dropped connection.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.supervisor.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let session = Session {
            url: self.server_url.clone(),
            token: self.token.clone(),
            shared: self.shared.clone(),
            events: self.event_tx.clone(),
        };
        let retry = self.retry.clone();
        self.supervisor = Some(tokio::spawn(async move { session.supervise(retry).await }));
        Ok(())
    }

    /// Join a room. The room is remembered and re-joined after every
    /// reconnect; while offline the join is deferred until the next session.
    pub async fn join_room(&self, project: &str) -> Result<(), ClientError> {
        let outgoing = {
            let mut shared = self.shared.lock().await;
            shared.controller.remember_room(project);
            shared.outgoing.clone()
        };
        match outgoing {
            Some(tx) => Self::send_via(tx, ClientEvent::JoinRoom(RoomRef::new(project))).await,
            None => Ok(()),
        }
    }

    pub async fn leave_room(&self, project: &str) -> Result<(), ClientError> {
        let outgoing = {
            let mut shared = self.shared.lock().await;
            shared.controller.forget_room(project);
            shared.view.forget_room(project);
            shared.outgoing.clone()
        };
        match outgoing {
            Some(tx) => Self::send_via(tx, ClientEvent::LeaveRoom(RoomRef::new(project))).await,
            None => Ok(()),
        }
    }

    /// Ask to become the editor of a task. The answer arrives as
    /// `edit-claim-started` or `edit-claim-conflict`.
    pub async fn claim(&self, project: &str, task: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::EditClaimStart(TaskRef::new(project, task))).await
    }

    pub async fn release(&self, project: &str, task: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::EditClaimStop(TaskRef::new(project, task))).await
    }

    pub async fn typing_start(&self, project: &str, task: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::TypingStart(TaskRef::new(project, task))).await
    }

    pub async fn typing_stop(&self, project: &str, task: &str) -> Result<(), ClientError> {
        self.send(ClientEvent::TypingStop(TaskRef::new(project, task))).await
    }

    /// Skip the pending backoff delay, or restart after `Failed`.
    /// No-op while connected or connecting.
    pub async fn retry_now(&self) {
        let mut shared = self.shared.lock().await;
        match shared.controller.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {}
            _ => {
                log::info!("Manual reconnect requested");
                shared.controller.retry_now();
                self.retry.notify_one();
            }
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.lock().await.controller.state()
    }

    /// Snapshot of the local view.
    pub async fn view(&self) -> LocalView {
        self.shared.lock().await.view.clone()
    }

    /// Stop the supervisor and drop the connection.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        let mut shared = self.shared.lock().await;
        shared.outgoing = None;
        shared.controller.on_transport_lost();
        shared.view.clear();
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        let outgoing = self.shared.lock().await.outgoing.clone();
        Self::send_via(outgoing.ok_or(ClientError::NotConnected)?, event).await
    }

    async fn send_via(tx: mpsc::Sender<ClientEvent>, event: ClientEvent) -> Result<(), ClientError> {
        tx.send(event).await.map_err(|_| ClientError::NotConnected)
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// State owned by the supervisor task.
struct Session {
    url: String,
    token: String,
    shared: Arc<Mutex<Shared>>,
    events: mpsc::Sender<CollabEvent>,
}

impl Session {
    async fn supervise(self, retry: Arc<Notify>) {
        let mut rng = StdRng::from_entropy();
        loop {
            let timeout = self.shared.lock().await.controller.policy().connect_timeout;
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(self.url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    if let Err(e) = self.run(ws).await {
                        log::warn!("Session with {} ended: {e}", self.url);
                    }
                    self.transport_lost().await;
                }
                Ok(Err(e)) => log::warn!("Failed to connect to {}: {e}", self.url),
                Err(_) => log::warn!("Connecting to {} timed out after {timeout:?}", self.url),
            }

            let (delay, state) = {
                let mut shared = self.shared.lock().await;
                let delay = shared.controller.next_delay(&mut rng);
                (delay, shared.controller.state())
            };
            self.emit(CollabEvent::StateChanged(state));

            match delay {
                Some(delay) => {
                    log::debug!("Reconnecting in {delay:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = retry.notified() => {}
                    }
                }
                None => retry.notified().await,
            }
        }
    }

    /// Drive one live connection until it drops.
    async fn run(&self, ws: WsStream) -> Result<(), ProtocolError> {
        let (mut ws_writer, mut ws_reader) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientEvent>(256);

        let authenticate = ClientEvent::Authenticate { token: self.token.clone() };
        Self::write(&mut ws_writer, &authenticate).await?;

        let rejoin = {
            let mut shared = self.shared.lock().await;
            shared.outgoing = Some(out_tx);
            shared.controller.on_connected()
        };
        self.emit(CollabEvent::StateChanged(ConnectionState::Connected));
        for project in rejoin {
            log::debug!("Re-joining room {project}");
            Self::write(&mut ws_writer, &ClientEvent::JoinRoom(RoomRef::new(project))).await?;
        }

        loop {
            tokio::select! {
                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match ServerEvent::decode(text.as_str()) {
                            Ok(event) => {
                                self.shared.lock().await.view.apply(&event);
                                self.emit(CollabEvent::Server(event));
                            }
                            Err(e) => log::warn!("Ignoring undecodable server frame: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(_)) => return Err(ProtocolError::ConnectionClosed),
                        Some(Ok(_)) => {}
                    }
                }
                event = out_rx.recv() => {
                    match event {
                        Some(event) => Self::write(&mut ws_writer, &event).await?,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn write(writer: &mut WsWriter, event: &ClientEvent) -> Result<(), ProtocolError> {
        let text = event.encode()?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn transport_lost(&self) {
        let was_connected = {
            let mut shared = self.shared.lock().await;
            shared.outgoing = None;
            let was_connected = shared.controller.on_transport_lost();
            if was_connected {
                shared.view.clear();
            }
            was_connected
        };
        if was_connected {
            log::info!("Lost connection to {}", self.url);
            self.emit(CollabEvent::ViewCleared);
        }
        self.emit(CollabEvent::StateChanged(ConnectionState::Disconnected));
    }

    fn emit(&self, event: CollabEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::debug!("Client event queue full, dropping {event:?}");
        }
    }
}
