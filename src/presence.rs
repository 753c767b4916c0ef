//! Ephemeral presence state derived from `typing`/`read` traffic.
//!
//! The coordinator relays typing indicators and read receipts without
//! persisting them; this tracker keeps the current picture in memory so the
//! room can log and expose who is active. It dies with the room — nothing
//! here is ever replayed to a late joiner.

use std::collections::{HashMap, HashSet};

use crate::protocol::Envelope;

/// Live presence picture for one room.
#[derive(Debug, Default)]
pub struct RoomPresence {
    typing: HashSet<String>,
    last_read: HashMap<String, i64>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an envelope into the presence picture.
    ///
    /// Only `typing` and `read` carry presence; everything else is ignored.
    /// Read markers never move backwards — a stale receipt (smaller
    /// `lastRead` than already seen) is dropped.
    pub fn observe(&mut self, envelope: &Envelope) {
        match envelope {
            Envelope::Typing { user, is_typing } => {
                if *is_typing {
                    self.typing.insert(user.clone());
                } else {
                    self.typing.remove(user);
                }
            }
            Envelope::Read { user, last_read } => {
                let entry = self.last_read.entry(user.clone()).or_insert(*last_read);
                if *last_read > *entry {
                    *entry = *last_read;
                }
            }
            _ => {}
        }
    }

    /// Users currently flagged as typing, sorted for stable logging.
    pub fn typing_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.typing.iter().cloned().collect();
        users.sort();
        users
    }

    pub fn is_typing(&self, user: &str) -> bool {
        self.typing.contains(user)
    }

    /// The newest read marker seen for a user, if any.
    pub fn last_read(&self, user: &str) -> Option<i64> {
        self.last_read.get(user).copied()
    }

    pub fn tracked_readers(&self) -> usize {
        self.last_read.len()
    }
}
