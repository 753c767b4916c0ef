//! # parlor — a durable chat room server
//!
//! Real-time shared chat over WebSockets: one coordinator task per room
//! owns the authoritative history, fans new messages out to every
//! connected socket, relays ephemeral presence signals, and replays the
//! full history to late joiners.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    WebSocket     ┌────────────┐
//! │ ChatClient │ ◄──────────────► │ ChatServer │
//! │ (per user) │    JSON frames   │ (listener) │
//! └────────────┘                  └─────┬──────┘
//!                                       │ path → room name
//!                                       ▼
//!                                ┌─────────────┐
//!                                │  ChatRoom   │  one task, serial events
//!                                │  (per room) │
//!                                └──┬───────┬──┘
//!                                   │       │
//!                        MessageLedger   MessageStore
//!                        (replay truth)  (SQLite, best-effort)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope (`add`/`update`/`all`/`typing`/`read`)
//! - [`ledger`] — in-memory ordered history, upsert-by-id, `(timestamp, id)` replay order
//! - [`broadcast`] — per-room connection registry with best-effort fan-out
//! - [`room`] — the room coordinator and room manager
//! - [`server`] — WebSocket listener and connection plumbing
//! - [`storage`] — SQLite store with additive schema migration
//! - [`presence`] — typing indicators and read markers (never persisted)
//! - [`client`] — headless client for tests and tooling

pub mod protocol;
pub mod ledger;
pub mod broadcast;
pub mod presence;
pub mod room;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use protocol::{now_ms, ChatMessage, Envelope, ProtocolError, Role, KNOWN_TAGS};
pub use ledger::MessageLedger;
pub use broadcast::{BroadcastStats, ConnectionId, ConnectionRegistry, OutboundSender};
pub use presence::RoomPresence;
pub use room::{ChatRoom, RoomEvent, RoomHandle, RoomManager, RoomStats};
pub use server::{ChatServer, ServerConfig, ServerStats};
pub use client::{ChatClient, ChatEvent, ConnectionState};
pub use storage::{MessageStore, StoreError};
