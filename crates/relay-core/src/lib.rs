//! Core types and error definitions for Relay.
//!
//! Relay distributes tasks to autonomous worker agents. This crate holds the
//! domain model shared by the durable store, the queue and the manager.
//!
//! # Main types
//!
//! - [`RelayError`]: Unified error enum, one variant per failure class.
//! - [`RelayResult`]: Convenience alias for `Result<T, RelayError>`.
//! - [`Agent`]: A registered worker with capabilities and health.
//! - [`Task`]: A unit of work and its lifecycle state.
//! - [`Priority`]: Queue tier (high, normal, low).

/// Agent records, registration and heartbeat types.
pub mod agent;
/// Error type shared by every Relay crate.
pub mod error;
/// Task records, lifecycle and statistics types.
pub mod task;

pub use agent::{
    Agent, AgentCapabilities, AgentFilter, AgentStatistics, AgentStatus, AgentUpdate, Heartbeat,
    NewAgent,
};
pub use error::{RelayError, RelayResult, StoreKind};
pub use task::{
    NewTask, Priority, StatusSummary, Task, TaskFilter, TaskOutcome, TaskStatistics, TaskStatus,
};

/// JSON object used for contexts, configuration and metrics.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
