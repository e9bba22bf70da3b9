//! Task distribution for Relay.
//!
//! Matches tasks to capable, healthy agents, enforces per-agent concurrency
//! through priority degradation, and drives each task through its lifecycle
//! with retry, timeout and cancellation. Two stores cooperate: the durable
//! store of record and an ephemeral queue/lock store owned by the queue.
//!
//! # Main types
//!
//! - [`TaskManager`]: Entry point for producers, agents and operators.
//! - [`TaskQueue`]: Priority tiers, exclusive dequeue, completion and timeout sweep.
//! - [`AgentDirectory`]: Agent registration, heartbeats and capability lookup.
//! - [`EphemeralStore`]: Atomic queue/lock primitives; [`MemoryEphemeralStore`] implements them.
//! - [`TimeoutSweeper`]: Background loop running the timeout sweep.
//! - [`RelayConfig`]: TOML configuration.

/// TOML configuration.
pub mod config;
/// Agent registry with health transitions.
pub mod directory;
/// Queue/lock store primitives and the in-process implementation.
pub mod ephemeral;
/// Task creation, completion policy and statistics.
pub mod manager;
/// Periodic timeout sweep.
pub mod sweeper;
/// Priority queue backed by the ephemeral store.
pub mod task_queue;

pub use config::{DirectoryConfig, QueueConfig, RelayConfig, StoreConfig, TaskConfig};
pub use directory::AgentDirectory;
pub use ephemeral::{EphemeralStore, MemoryEphemeralStore, TierKey};
pub use manager::{AgentQueueStatus, TaskManager};
pub use sweeper::TimeoutSweeper;
pub use task_queue::{
    Completion, DequeuedTask, QueueDepth, RehydrateReport, TaskQueue, TaskResidue,
};
