//! Core data models for the jar store.
//!
//! Folders own items; both map to SQLite rows via `sqlx::FromRow` and
//! serialize as JSON via `serde`. Sync records are the whole-record
//! snapshots exchanged with a remote backend.

pub mod change;
pub mod folder;
pub mod item;
pub mod sync_record;
