//! In-memory message ledger — the authoritative ordered set for one room.
//!
//! The ledger is the single source of truth for replay. It is mutated only
//! through [`MessageLedger::upsert`] and rebuilt wholesale from persisted
//! rows on room activation. Entries are kept in arrival order internally;
//! replay order is always recomputed as ascending `(timestamp, id)`, so a
//! late-arriving message with an early timestamp sorts early on replay even
//! though it was broadcast late.

use crate::protocol::{now_ms, ChatMessage};

/// The canonical in-memory message set for a single room.
#[derive(Debug, Default)]
pub struct MessageLedger {
    messages: Vec<ChatMessage>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message, or replace the existing entry with the same id.
    ///
    /// A message arriving without a timestamp is stamped with the current
    /// wall clock rather than rejected. Returns `true` when an existing
    /// entry was replaced (an edit), `false` on first insert.
    pub fn upsert(&mut self, mut msg: ChatMessage) -> bool {
        if msg.timestamp <= 0 {
            msg.timestamp = now_ms();
        }

        match self.messages.iter_mut().find(|m| m.id == msg.id) {
            Some(existing) => {
                *existing = msg;
                true
            }
            None => {
                self.messages.push(msg);
                false
            }
        }
    }

    /// Point-in-time copy of the full history, ordered by ascending
    /// `(timestamp, id)`. Later mutations do not affect the returned copy.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        let mut out = self.messages.clone();
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    /// Rebuild the ledger from persisted rows at startup.
    ///
    /// Goes through `upsert` so duplicated ids collapse and missing
    /// timestamps are stamped; repeat loads converge on the same state.
    pub fn load_from(&mut self, rows: Vec<ChatMessage>) {
        self.messages.clear();
        for row in rows {
            self.upsert(row);
        }
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
