//! The room coordinator — one task per room, one event at a time.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── ChatRoom (per name) ── MessageLedger (replay truth)
//! Client B ──┘        │
//!                     ├── MessageStore (SQLite, best-effort)
//!                     ├── RoomPresence (typing / read markers)
//!                     │
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! All inbound events for a room (connect, message, disconnect) funnel
//! through one `mpsc` queue consumed by a single task, so ledger mutation
//! and the persist-then-broadcast decision never race with another event
//! in the same room. The durable write sits inside that sequence but its
//! failure is capped: broadcasting to live sockets never waits on write
//! success.
//!
//! Two orders coexist on purpose: live delivery follows the coordinator's
//! processing order, while replay follows the ledger's `(timestamp, id)`
//! order. A late-arriving message with an early timestamp is broadcast
//! late but sorted early on replay.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 9

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::broadcast::{ConnectionId, ConnectionRegistry, OutboundSender};
use crate::ledger::MessageLedger;
use crate::presence::RoomPresence;
use crate::protocol::{now_ms, ChatMessage, Envelope, KNOWN_TAGS};
use crate::storage::MessageStore;

/// Inbound events routed to a room's serial queue.
#[derive(Debug)]
pub enum RoomEvent {
    Connect {
        id: ConnectionId,
        outbound: OutboundSender,
    },
    Message {
        id: ConnectionId,
        raw: String,
    },
    Disconnect {
        id: ConnectionId,
    },
}

/// Clonable address of a running room task.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    name: String,
    tx: mpsc::UnboundedSender<RoomEvent>,
}

impl RoomHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an event for the room. On failure the event is handed back —
    /// the room has hibernated and the caller may retry against a fresh
    /// instance.
    pub fn send(&self, event: RoomEvent) -> Result<(), RoomEvent> {
        self.tx.send(event).map_err(|e| e.0)
    }

    /// Whether the room task behind this handle has ended.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-room counters, logged when the room hibernates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomStats {
    pub frames_in: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub decode_failures: u64,
    pub passthrough_frames: u64,
}

/// One chat room: ledger, store, live sockets, presence.
///
/// The room is driven exclusively through [`ChatRoom::run`]; every method
/// below is synchronous and assumes it is the only code touching the
/// state, which the serial event queue guarantees.
pub struct ChatRoom {
    name: String,
    ledger: MessageLedger,
    store: Option<MessageStore>,
    connections: ConnectionRegistry,
    presence: RoomPresence,
    stats: RoomStats,
}

impl ChatRoom {
    /// Create a room. Call [`activate`](Self::activate) before serving
    /// events; [`spawn`](Self::spawn) does both.
    pub fn new(name: impl Into<String>, store: Option<MessageStore>) -> Self {
        Self {
            name: name.into(),
            ledger: MessageLedger::new(),
            store,
            connections: ConnectionRegistry::new(),
            presence: RoomPresence::new(),
            stats: RoomStats::default(),
        }
    }

    /// Room activation: ensure the durable schema, then rebuild the ledger
    /// from persisted rows. Safe to run repeatedly — a room woken after
    /// hibernation converges on the same state.
    pub fn activate(&mut self) {
        let Some(store) = &self.store else {
            log::info!("Room {} activated without persistence", self.name);
            return;
        };

        if let Err(e) = store.ensure_schema() {
            log::error!("Schema init failed for room {}: {e}", self.name);
        }

        match store.load_all() {
            Ok(rows) => {
                let count = rows.len();
                self.ledger.load_from(rows);
                log::info!("Room {} activated with {count} persisted messages", self.name);
            }
            Err(e) => {
                log::error!("Failed to load history for room {}: {e}; starting empty", self.name);
            }
        }
    }

    /// Activate the room and run it on its own task.
    pub fn spawn(name: impl Into<String>, store: Option<MessageStore>) -> RoomHandle {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut room = ChatRoom::new(name.clone(), store);
        room.activate();
        tokio::spawn(room.run(rx));
        RoomHandle { name, tx }
    }

    /// Serial event loop. Processes one event at a time until the last
    /// connection leaves, then hibernates (the task ends; the next join
    /// builds a fresh instance that reloads from the store).
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
        while let Some(event) = events.recv().await {
            let was_disconnect = matches!(event, RoomEvent::Disconnect { .. });
            self.handle(event);

            if was_disconnect && self.connections.is_empty() {
                // Stop accepting events, then drain the few that may have
                // raced in. A connect that slips past the drain loses its
                // socket and the client reconnects into a fresh room.
                events.close();
                while let Ok(event) = events.try_recv() {
                    self.handle(event);
                }
                break;
            }
        }

        if !self.connections.is_empty() {
            log::warn!(
                "Room {} shutting down with {} connections still registered",
                self.name,
                self.connections.len()
            );
        }
        log::info!(
            "Room {} hibernating: {} messages in ledger, {} frames in, {} persisted, {} persist failures",
            self.name,
            self.ledger.len(),
            self.stats.frames_in,
            self.stats.persisted,
            self.stats.persist_failures
        );
    }

    fn handle(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Connect { id, outbound } => self.on_connect(id, outbound),
            RoomEvent::Message { id, raw } => self.on_message(id, &raw),
            RoomEvent::Disconnect { id } => self.on_disconnect(id),
        }
    }

    /// Register a connection and replay history to it — one `all` frame,
    /// to this connection only. A cold room sends nothing.
    pub fn on_connect(&mut self, id: ConnectionId, outbound: OutboundSender) {
        self.connections.add(id, outbound);
        log::info!(
            "Connection {id} joined room {} ({} online)",
            self.name,
            self.connections.len()
        );

        if self.ledger.is_empty() {
            return;
        }

        match Envelope::all(self.ledger.snapshot()).encode() {
            Ok(frame) => {
                self.connections.send_to(&id, Utf8Bytes::from(frame));
            }
            Err(e) => {
                log::error!("Failed to encode history for {id} in room {}: {e}", self.name);
            }
        }
    }

    /// Decode and dispatch one inbound frame.
    ///
    /// Malformed JSON is dropped. Valid JSON with a known tag but a bad
    /// body is dropped too. Valid JSON with an unrecognized tag is
    /// broadcast verbatim so newer clients keep working against this
    /// server.
    pub fn on_message(&mut self, id: ConnectionId, raw: &str) {
        self.stats.frames_in += 1;

        match Envelope::decode(raw) {
            Ok(envelope) => self.dispatch(envelope),
            Err(decode_err) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value) => {
                    let tag = value.get("type").and_then(|t| t.as_str());
                    if tag.is_some_and(|t| KNOWN_TAGS.contains(&t)) {
                        self.stats.decode_failures += 1;
                        log::warn!(
                            "Dropping malformed {} frame from {id} in room {}: {decode_err}",
                            tag.unwrap_or_default(),
                            self.name
                        );
                    } else {
                        self.stats.passthrough_frames += 1;
                        log::debug!(
                            "Forwarding unrecognized frame from {id} in room {} verbatim",
                            self.name
                        );
                        self.broadcast_frame(Utf8Bytes::from(raw.to_string()), &[]);
                    }
                }
                Err(e) => {
                    self.stats.decode_failures += 1;
                    log::warn!("Dropping non-JSON frame from {id} in room {}: {e}", self.name);
                }
            },
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Add(msg) => {
                let msg = self.accept_message(msg);
                self.broadcast_envelope(&Envelope::Add(msg));
            }
            Envelope::Update(msg) => {
                let msg = self.accept_message(msg);
                self.broadcast_envelope(&Envelope::Update(msg));
            }
            envelope @ (Envelope::Typing { .. } | Envelope::Read { .. }) => {
                self.presence.observe(&envelope);
                match &envelope {
                    Envelope::Typing { user, is_typing } => {
                        log::trace!("Presence: {user} typing={is_typing} in room {}", self.name);
                    }
                    Envelope::Read { user, last_read } => {
                        log::trace!("Presence: {user} read up to {last_read} in room {}", self.name);
                    }
                    _ => {}
                }
                self.broadcast_envelope(&envelope);
            }
            // `all` is synthesized server-side on join; inbound copies are
            // not interpreted, just forwarded like any other stray tag.
            envelope @ Envelope::All { .. } => {
                self.broadcast_envelope(&envelope);
            }
        }
    }

    /// Take a durable message into the room: stamp a missing timestamp,
    /// update the in-memory truth first, then persist best-effort. The
    /// returned message is what gets broadcast, so every client sees the
    /// stamped copy.
    fn accept_message(&mut self, mut msg: ChatMessage) -> ChatMessage {
        if msg.timestamp <= 0 {
            msg.timestamp = now_ms();
        }

        let replaced = self.ledger.upsert(msg.clone());
        if replaced {
            log::debug!("Message {} rewritten in room {}", msg.id, self.name);
        }

        if let Some(store) = &self.store {
            match store.persist(&msg) {
                Ok(()) => self.stats.persisted += 1,
                Err(e) => {
                    // Durability is best-effort; live delivery proceeds.
                    self.stats.persist_failures += 1;
                    log::error!("Failed to persist message {} in room {}: {e}", msg.id, self.name);
                }
            }
        }

        msg
    }

    fn broadcast_envelope(&mut self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(frame) => {
                self.broadcast_frame(Utf8Bytes::from(frame), &[]);
            }
            Err(e) => {
                log::error!("Failed to encode {} envelope in room {}: {e}", envelope.tag(), self.name);
            }
        }
    }

    /// Serialize-once fan-out to every connection except `exclude`.
    fn broadcast_frame(&mut self, frame: Utf8Bytes, exclude: &[ConnectionId]) -> usize {
        self.connections.broadcast(frame, exclude)
    }

    pub fn on_disconnect(&mut self, id: ConnectionId) {
        if self.connections.remove(&id) {
            log::info!(
                "Connection {id} left room {} ({} online)",
                self.name,
                self.connections.len()
            );
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn store(&self) -> Option<&MessageStore> {
        self.store.as_ref()
    }

    pub fn presence(&self) -> &RoomPresence {
        &self.presence
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> RoomStats {
        self.stats
    }
}

/// Maps room names to live room tasks.
///
/// A handle whose room has hibernated is replaced on next access, which is
/// what wakes a room back up: the fresh instance reloads its ledger from
/// the store during activation.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    storage_dir: Option<PathBuf>,
}

impl RoomManager {
    pub fn new(storage_dir: Option<PathBuf>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            storage_dir,
        }
    }

    /// Get the live room for `name`, spawning (or re-waking) it if needed.
    pub async fn get_or_create(&self, name: &str) -> RoomHandle {
        {
            let rooms = self.rooms.read().await;
            if let Some(handle) = rooms.get(name) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(handle) = rooms.get(name) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let handle = ChatRoom::spawn(name, self.open_store(name));
        rooms.insert(name.to_string(), handle.clone());
        handle
    }

    /// Register a connection with its room, retrying against a fresh
    /// instance if the room hibernates between lookup and send.
    pub async fn connect(
        &self,
        name: &str,
        id: ConnectionId,
        outbound: OutboundSender,
    ) -> RoomHandle {
        let mut attempts = 0;
        loop {
            let handle = self.get_or_create(name).await;
            match handle.send(RoomEvent::Connect {
                id,
                outbound: outbound.clone(),
            }) {
                Ok(()) => return handle,
                Err(_) if attempts < 3 => attempts += 1,
                Err(_) => {
                    log::error!("Could not register {id} with room {name}");
                    return handle;
                }
            }
        }
    }

    fn open_store(&self, name: &str) -> Option<MessageStore> {
        let dir = self.storage_dir.as_ref()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::error!("Could not create data directory {}: {e}", dir.display());
            return None;
        }

        let path = dir.join(format!("{}.db", sanitize_room_name(name)));
        match MessageStore::open(&path) {
            Ok(store) => Some(store),
            Err(e) => {
                log::error!(
                    "Could not open store {} for room {name}: {e}; continuing without persistence",
                    path.display()
                );
                None
            }
        }
    }

    /// Number of rooms with a live task.
    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|h| !h.is_closed())
            .count()
    }

    /// Names of rooms with a live task.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Reduce a room name to something safe for a filename. Only the store
/// path is sanitized; the room keeps its wire name verbatim.
pub fn sanitize_room_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "room".to_string()
    } else {
        cleaned
    }
}
