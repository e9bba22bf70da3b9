//! Durable store of record for Relay.
//!
//! Holds every agent and task. Status, retry counts, timestamps and results
//! written here are authoritative; the queue's ephemeral state is reconciled
//! against them.
//!
//! # Main types
//!
//! - [`AgentStore`] / [`TaskStore`]: async persistence traits.
//! - [`DurableStore`]: both traits behind one backend.
//! - [`SqliteStore`]: SQLite implementation with versioned migrations.

/// Versioned schema definitions.
pub mod migrations;
/// SQLite-backed implementation.
pub mod sqlite;
/// Persistence traits.
pub mod store;

pub use sqlite::SqliteStore;
pub use store::{AgentMutation, AgentStore, DurableStore, TaskMutation, TaskStore};
