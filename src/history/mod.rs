// src/history/mod.rs

//! Durable record of finished instances.
//!
//! The store consumes terminal snapshots, enforces retention lazily on
//! every write, and owns schema migration across versions. Persistence
//! can be disabled entirely through configuration, in which case the
//! runtime simply holds no store.

pub mod migrate;
pub mod store;

pub use migrate::SCHEMA_VERSION;
pub use store::{HistoryStore, RetentionPolicy};
