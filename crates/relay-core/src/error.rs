use crate::task::TaskStatus;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`RelayError`].
pub type RelayResult<T> = Result<T, RelayError>;

/// Which of the two stores an infrastructure failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// The relational store of record.
    Durable,
    /// The queue/lock store.
    Ephemeral,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Durable => write!(f, "durable"),
            StoreKind::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// Top-level error type for Relay.
///
/// Task-level failures (an agent reporting `success = false`, a timeout) are
/// recorded on the task itself; only infrastructure and request errors travel
/// through this type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// An agent or task does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"agent"` or `"task"`.
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A uniqueness rule was violated (duplicate agent name).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No active agent supports the requested task type.
    #[error("No capable agent for task type '{0}'")]
    NoCapableAgent(String),

    /// A retry was requested past the task's retry budget.
    #[error("Retry budget exhausted for task {task_id} ({retry_count}/{max_retries})")]
    RetryBudgetExhausted {
        /// The task that cannot be retried.
        task_id: Uuid,
        /// Retries already consumed.
        retry_count: u32,
        /// Retry budget of the task.
        max_retries: u32,
    },

    /// One of the stores could not be reached; the operation was aborted.
    #[error("{store} store unavailable: {reason}")]
    StoreUnavailable {
        /// The store that failed.
        store: StoreKind,
        /// Underlying failure description.
        reason: String,
    },

    /// A task exceeded its execution budget.
    #[error("Task {0} timed out")]
    Timeout(Uuid),

    /// A request failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A task state-machine transition that is not allowed.
    #[error("Task {task_id} cannot transition from '{from}' to '{to}'")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: Uuid,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Shorthand for a missing agent.
    pub fn agent_not_found(id: impl ToString) -> Self {
        RelayError::NotFound {
            kind: "agent",
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing task.
    pub fn task_not_found(id: impl ToString) -> Self {
        RelayError::NotFound {
            kind: "task",
            id: id.to_string(),
        }
    }

    /// Shorthand for a durable store failure.
    pub fn durable(reason: impl Into<String>) -> Self {
        RelayError::StoreUnavailable {
            store: StoreKind::Durable,
            reason: reason.into(),
        }
    }

    /// Shorthand for an ephemeral store failure.
    pub fn ephemeral(reason: impl Into<String>) -> Self {
        RelayError::StoreUnavailable {
            store: StoreKind::Ephemeral,
            reason: reason.into(),
        }
    }

    /// Whether this error means a store could not be reached.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RelayError::StoreUnavailable { .. })
    }
}
