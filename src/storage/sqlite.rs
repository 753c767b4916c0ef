//! SQLite-backed message store.
//!
//! Row shape: `id TEXT PRIMARY KEY, user TEXT, role TEXT, content TEXT,
//! replyTo TEXT, timestamp INTEGER DEFAULT 0`. The quote column holds the
//! JSON-serialized reply snapshot or NULL.
//!
//! Two tolerances keep old deployments loading:
//! - `ensure_schema` widens a legacy table with `ALTER TABLE … ADD COLUMN`
//!   for any missing column; a failed ALTER is logged and skipped, and the
//!   scan query adapts to whatever columns actually exist.
//! - Row decoding is lossy: an unparseable quote drops only that field, a
//!   zero/NULL timestamp is stamped at load time, an unknown role label
//!   degrades to `user`. A bad row never blocks the rest of the history.

use rusqlite::{params, Connection};
use std::path::Path;

use crate::protocol::{now_ms, ChatMessage, Role};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    SerializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable message table for one room.
pub struct MessageStore {
    conn: Connection,
}

impl MessageStore {
    /// Open (or create) the store at `path` and ensure the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Open a private in-memory store. Used by rooms without a data
    /// directory and by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Idempotent schema setup: create the table if absent, then widen a
    /// legacy table with any missing columns. Additive only.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                user TEXT,
                role TEXT,
                content TEXT,
                replyTo TEXT,
                timestamp INTEGER DEFAULT 0
            )",
            [],
        )?;

        let columns = self.columns()?;

        if !columns.iter().any(|c| c == "replyTo") {
            if let Err(e) = self
                .conn
                .execute("ALTER TABLE messages ADD COLUMN replyTo TEXT", [])
            {
                log::error!("Failed to add replyTo column: {e}");
            } else {
                log::info!("Added replyTo column to existing table");
            }
        }

        if !columns.iter().any(|c| c == "timestamp") {
            if let Err(e) = self
                .conn
                .execute("ALTER TABLE messages ADD COLUMN timestamp INTEGER DEFAULT 0", [])
            {
                log::error!("Failed to add timestamp column: {e}");
            } else {
                log::info!("Added timestamp column to existing table");
            }
        }

        Ok(())
    }

    /// Current column names of the messages table.
    pub fn columns(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(messages)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Write or overwrite the row for `msg.id`.
    ///
    /// If the full-row write fails, retries once without the quote column
    /// so a problematic quote cannot cost the message itself.
    pub fn persist(&self, msg: &ChatMessage) -> Result<(), StoreError> {
        let quote = match &msg.reply_to {
            Some(quoted) => Some(
                serde_json::to_string(quoted)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))?,
            ),
            None => None,
        };

        let full = self.conn.execute(
            "INSERT OR REPLACE INTO messages (id, user, role, content, replyTo, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.id,
                msg.user,
                msg.role.as_str(),
                msg.content,
                quote,
                msg.timestamp
            ],
        );

        match full {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("Full-row persist failed for {}: {e}; retrying without quote", msg.id);
                self.conn.execute(
                    "INSERT OR REPLACE INTO messages (id, user, role, content, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![msg.id, msg.user, msg.role.as_str(), msg.content, msg.timestamp],
                )?;
                Ok(())
            }
        }
    }

    /// Full scan in replay order.
    ///
    /// Ordered by `(timestamp, id)` when the timestamp column exists,
    /// falling back to `id` alone on a schema that predates it (possible
    /// when the additive migration could not run).
    pub fn load_all(&self) -> Result<Vec<ChatMessage>, StoreError> {
        let columns = self.columns()?;
        let has_timestamp = columns.iter().any(|c| c == "timestamp");

        let sql = if has_timestamp {
            "SELECT * FROM messages ORDER BY timestamp ASC, id ASC"
        } else {
            "SELECT * FROM messages ORDER BY id ASC"
        };

        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get("id")?;
            let user: String = row.get::<_, Option<String>>("user")?.unwrap_or_default();
            let role: String = row.get::<_, Option<String>>("role")?.unwrap_or_default();
            let content: String = row.get::<_, Option<String>>("content")?.unwrap_or_default();
            // Both columns may be absent on a legacy table.
            let quote: Option<String> = row.get::<_, Option<String>>("replyTo").ok().flatten();
            let timestamp: i64 = row
                .get::<_, Option<i64>>("timestamp")
                .ok()
                .flatten()
                .unwrap_or(0);
            Ok((id, user, role, content, quote, timestamp))
        })?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(raw) => out.push(decode_row(raw)),
                Err(e) => log::warn!("Skipping undecodable row: {e}"),
            }
        }
        Ok(out)
    }

    /// Number of persisted rows.
    pub fn message_count(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Decode one raw row, degrading gracefully on per-field corruption.
fn decode_row(
    (id, user, role, content, quote, timestamp): (String, String, String, String, Option<String>, i64),
) -> ChatMessage {
    let role = match Role::from_label(&role) {
        Some(role) => role,
        None => {
            if !role.is_empty() {
                log::warn!("Unknown role {role:?} on message {id}; treating as user");
            }
            Role::User
        }
    };

    let reply_to = quote.and_then(|raw| match serde_json::from_str::<ChatMessage>(&raw) {
        Ok(quoted) => Some(Box::new(quoted)),
        Err(e) => {
            log::warn!("Dropping unparseable quote on message {id}: {e}");
            None
        }
    });

    // Rows written before the timestamp column carry 0; stamp them at
    // load so replay ordering still has something to work with.
    let timestamp = if timestamp > 0 { timestamp } else { now_ms() };

    ChatMessage {
        id,
        content,
        user,
        role,
        reply_to,
        timestamp,
    }
}
