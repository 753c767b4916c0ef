//! WebSocket front door: accepts connections and routes each one to the
//! room named by its request path.
//!
//! The server owns no chat state. Each accepted socket gets a connection
//! id and an outbound queue, registers with its room, and then pumps:
//! inbound text frames go onto the room's serial event queue, outbound
//! frames from the room go onto the socket. Everything interesting
//! happens in [`crate::room`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use uuid::Uuid;

use crate::room::{RoomEvent, RoomManager};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory for per-room SQLite files (None = rooms are in-memory)
    pub storage_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            storage_dir: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub active_rooms: usize,
}

/// The chat server.
pub struct ChatServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl ChatServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.storage_dir.clone()));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory rooms).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled under the given directory.
    pub fn with_storage(bind_addr: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_dir: Some(dir.into()),
        })
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Chat server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection for its whole lifetime.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture the request path during the handshake; it names the room.
        let mut path = String::new();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = req.uri().path().to_string();
                Ok(resp)
            },
        )
        .await?;

        let room_name = room_name_from_path(&path);
        let id = Uuid::new_v4();
        log::info!("Connection {id} from {addr} joining room {room_name:?}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Utf8Bytes>();
        let handle = rooms.connect(&room_name, id, out_tx).await;

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_frames += 1;
                            }
                            if handle.send(RoomEvent::Message { id, raw: text.to_string() }).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            // The protocol is JSON text; binary frames are noise.
                            log::debug!("Ignoring binary frame from {id}");
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outbound = out_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if ws_sender.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        // The room dropped us (hibernation race); the
                        // client reconnects into a fresh instance.
                        None => break,
                    }
                }
            }
        }

        let _ = handle.send(RoomEvent::Disconnect { id });
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {id} from {addr} closed");

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room manager.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

/// The room is the last non-empty path segment; the bare root lands in a
/// default room.
fn room_name_from_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .unwrap_or("lobby")
        .to_string()
}
