//! # Drover Persistence
//!
//! Durable key-value clients for the idempotency store.
//!
//! Supports:
//! - SQLite (single node, survives restarts)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConfig, SqliteKeyValue};
