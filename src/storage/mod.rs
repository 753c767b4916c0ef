//! Durable storage for room history.
//!
//! One room owns one [`MessageStore`] over one SQLite database. The store
//! is a thin adapter: parameterized upserts keyed by message id and a full
//! ordered scan for rebuilding the ledger on activation. Schema changes are
//! additive only — a legacy database is widened with missing columns on
//! first open, never rewritten.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 4

pub mod sqlite;

pub use sqlite::{MessageStore, StoreError};
