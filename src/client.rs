//! Headless WebSocket chat client.
//!
//! Drives the same wire protocol a browser client would: connect to
//! `ws://host/<room>`, receive the join-time history snapshot, then a
//! typed event per broadcast frame. Used by the integration tests in place
//! of a rendering layer.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ChatMessage, Envelope, ProtocolError, Role};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the chat client.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Join-time history snapshot (only sent for non-empty rooms)
    History(Vec<ChatMessage>),
    /// A message was added
    Added(ChatMessage),
    /// An existing message was rewritten
    Updated(ChatMessage),
    /// Someone's typing indicator changed
    Typing { user: String, is_typing: bool },
    /// Someone advanced their read marker
    Read { user: String, last_read: i64 },
    /// A frame this client doesn't understand, passed up verbatim
    Raw(String),
}

/// The chat client.
pub struct ChatClient {
    user: String,
    room: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ChatEvent>>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl ChatClient {
    /// Create a client for `user` in `room` against `server_url`
    /// (e.g. `ws://127.0.0.1:8787`).
    pub fn new(
        user: impl Into<String>,
        room: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user: user.into(),
            room: room.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ChatEvent>> {
        self.event_rx.take()
    }

    /// Connect to the room.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url, self.room);
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                let (mut ws_writer, mut ws_reader) = ws_stream.split();

                // Writer task: forward the outgoing channel to the socket.
                let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
                self.outgoing_tx = Some(out_tx);
                tokio::spawn(async move {
                    while let Some(frame) = out_rx.recv().await {
                        if ws_writer.send(Message::text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // Channel closed — say goodbye properly.
                    let _ = ws_writer.send(Message::Close(None)).await;
                });

                *self.state.write().await = ConnectionState::Connected;
                let _ = self.event_tx.send(ChatEvent::Connected).await;

                // Reader task: decode frames into events.
                let event_tx = self.event_tx.clone();
                let state = self.state.clone();
                tokio::spawn(async move {
                    while let Some(frame) = ws_reader.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                let event = match Envelope::decode(text.as_str()) {
                                    Ok(Envelope::All { messages }) => ChatEvent::History(messages),
                                    Ok(Envelope::Add(msg)) => ChatEvent::Added(msg),
                                    Ok(Envelope::Update(msg)) => ChatEvent::Updated(msg),
                                    Ok(Envelope::Typing { user, is_typing }) => {
                                        ChatEvent::Typing { user, is_typing }
                                    }
                                    Ok(Envelope::Read { user, last_read }) => {
                                        ChatEvent::Read { user, last_read }
                                    }
                                    Err(_) => ChatEvent::Raw(text.to_string()),
                                };
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Message::Close(_)) | Err(_) => break,
                            _ => {}
                        }
                    }

                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.send(ChatEvent::Disconnected).await;
                });

                Ok(())
            }
            Err(e) => {
                log::debug!("Connect to {url} failed: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Compose and send a new message. Returns the message as sent —
    /// rendering should wait for the server's echo rather than trust it.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<ChatMessage, ProtocolError> {
        let msg = ChatMessage::new(self.user.as_str(), Role::User, content);
        self.send_envelope(&Envelope::add(msg.clone())).await?;
        Ok(msg)
    }

    /// Compose and send a reply quoting `quoted` as it is right now.
    pub async fn send_reply(
        &self,
        content: impl Into<String>,
        quoted: &ChatMessage,
    ) -> Result<ChatMessage, ProtocolError> {
        let msg = ChatMessage::reply(self.user.as_str(), Role::User, content, quoted);
        self.send_envelope(&Envelope::add(msg.clone())).await?;
        Ok(msg)
    }

    /// Send a rewrite of an existing message (same id).
    pub async fn edit_message(&self, msg: ChatMessage) -> Result<(), ProtocolError> {
        self.send_envelope(&Envelope::update(msg)).await
    }

    /// Toggle this user's typing indicator.
    pub async fn send_typing(&self, is_typing: bool) -> Result<(), ProtocolError> {
        self.send_envelope(&Envelope::typing(self.user.as_str(), is_typing))
            .await
    }

    /// Advance this user's read marker.
    pub async fn send_read(&self, last_read: i64) -> Result<(), ProtocolError> {
        self.send_envelope(&Envelope::read(self.user.as_str(), last_read))
            .await
    }

    /// Send any envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        self.send_raw(envelope.encode()?).await
    }

    /// Send a raw frame as-is (used to exercise passthrough behavior).
    pub async fn send_raw(&self, frame: String) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Close the connection. The writer task sends a close frame on its
    /// way out; the server sees the socket go and unregisters us.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
