use async_trait::async_trait;
use relay_core::{
    Agent, AgentFilter, AgentStatus, RelayResult, StatusSummary, Task, TaskFilter,
};
use uuid::Uuid;

/// Closure applied to an agent row inside a single store transaction.
pub type AgentMutation = Box<dyn FnOnce(&mut Agent) -> RelayResult<()> + Send>;

/// Closure applied to a task row inside a single store transaction.
/// Returning an error aborts the write.
pub type TaskMutation = Box<dyn FnOnce(&mut Task) -> RelayResult<()> + Send>;

/// Persistence for agent records.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert a new agent. A taken name fails with `Conflict`.
    async fn insert_agent(&self, agent: &Agent) -> RelayResult<()>;

    /// Look up an agent by id.
    async fn get_agent(&self, id: Uuid) -> RelayResult<Option<Agent>>;

    /// Look up an agent by its unique name.
    async fn get_agent_by_name(&self, name: &str) -> RelayResult<Option<Agent>>;

    /// Read-modify-write an agent atomically. `None` if it does not exist.
    async fn modify_agent(&self, id: Uuid, mutation: AgentMutation)
        -> RelayResult<Option<Agent>>;

    /// Remove an agent and, by cascade, its tasks. Returns whether it existed.
    async fn delete_agent(&self, id: Uuid) -> RelayResult<bool>;

    /// List agents, newest first.
    async fn list_agents(&self, filter: &AgentFilter) -> RelayResult<Vec<Agent>>;

    /// Agent counts grouped by status.
    async fn count_agents_by_status(&self) -> RelayResult<Vec<(AgentStatus, u64)>>;

    /// Bump the total and success/failure counters of an agent.
    async fn record_task_outcome(&self, agent_id: Uuid, success: bool) -> RelayResult<()>;
}

/// Persistence for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Its agent must exist.
    async fn insert_task(&self, task: &Task) -> RelayResult<()>;

    /// Look up a task by id.
    async fn get_task(&self, id: Uuid) -> RelayResult<Option<Task>>;

    /// Read-modify-write a task atomically. `None` if it does not exist.
    async fn modify_task(&self, id: Uuid, mutation: TaskMutation) -> RelayResult<Option<Task>>;

    /// List tasks matching `filter`, newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> RelayResult<Vec<Task>>;

    /// Count and mean duration per status, optionally for one agent.
    async fn summarize_tasks(&self, agent_id: Option<Uuid>) -> RelayResult<Vec<StatusSummary>>;
}

/// The store of record: agents and tasks behind one backend.
pub trait DurableStore: AgentStore + TaskStore {}

impl<T: AgentStore + TaskStore> DurableStore for T {}
