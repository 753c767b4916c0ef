//! Fan-out to the live sockets of one room.
//!
//! The registry maps connection ids to the outbound queue of each socket's
//! writer task. It is owned exclusively by the room task, so no lock guards
//! it; the room's serial event loop is the only mutator. Frames are
//! serialized once by the caller and handed out as cheaply clonable UTF-8
//! bytes.
//!
//! Delivery is best-effort per socket: a queue whose reader is gone counts
//! as a dropped frame and never blocks delivery to the remaining peers.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use uuid::Uuid;

/// Stable per-connection identity, assigned at accept time.
pub type ConnectionId = Uuid;

/// Outbound queue handle for one connection's writer task.
pub type OutboundSender = mpsc::UnboundedSender<Utf8Bytes>;

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// The set of currently-connected sockets in one room.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    peers: HashMap<ConnectionId, OutboundSender>,
    stats: BroadcastStats,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue.
    pub fn add(&mut self, id: ConnectionId, sender: OutboundSender) {
        self.peers.insert(id, sender);
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        self.peers.remove(id).is_some()
    }

    /// Deliver a frame to a single connection.
    pub fn send_to(&mut self, id: &ConnectionId, payload: Utf8Bytes) -> bool {
        match self.peers.get(id) {
            Some(sender) if sender.send(payload).is_ok() => {
                self.stats.frames_sent += 1;
                true
            }
            Some(_) => {
                self.stats.frames_dropped += 1;
                log::debug!("Dropped frame for {id}: writer gone");
                false
            }
            None => false,
        }
    }

    /// Deliver a frame to every connection except those in `exclude`.
    ///
    /// Returns the number of sockets the frame was queued on. A dead
    /// socket is skipped and counted, never an error for the others.
    pub fn broadcast(&mut self, payload: Utf8Bytes, exclude: &[ConnectionId]) -> usize {
        let mut delivered = 0;
        for (id, sender) in &self.peers {
            if exclude.contains(id) {
                continue;
            }
            if sender.send(payload.clone()).is_ok() {
                delivered += 1;
            } else {
                self.stats.frames_dropped += 1;
                log::debug!("Dropped broadcast frame for {id}: writer gone");
            }
        }
        self.stats.frames_sent += delivered as u64;
        delivered
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }
}
