use crate::config::{RelayConfig, TaskConfig};
use crate::directory::AgentDirectory;
use crate::ephemeral::EphemeralStore;
use crate::task_queue::{QueueDepth, TaskQueue};
use chrono::Utc;
use relay_core::{
    Agent, AgentStatus, JsonMap, NewTask, Priority, RelayError, RelayResult, Task, TaskFilter,
    TaskOutcome, TaskStatistics, TaskStatus,
};
use relay_store::{AgentStore, DurableStore, TaskStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Load and queue view of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQueueStatus {
    pub agent_id: Uuid,
    pub agent_name: String,
    pub status: AgentStatus,
    pub health_score: f64,
    pub max_concurrent_tasks: u32,
    pub active_tasks: usize,
    pub available_capacity: usize,
    pub queue_depth: QueueDepth,
}

/// Entry point for producers, polling agents and operators.
///
/// Picks agents through the [`AgentDirectory`], moves tasks through the
/// [`TaskQueue`] and applies the retry policy to failures and timeouts.
pub struct TaskManager {
    store: Arc<dyn DurableStore>,
    queue: TaskQueue,
    directory: AgentDirectory,
    config: TaskConfig,
}

impl TaskManager {
    /// Wire a manager over a durable store, handing it sole ownership of `ephemeral`.
    pub fn new(
        store: Arc<dyn DurableStore>,
        ephemeral: Box<dyn EphemeralStore>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            queue: TaskQueue::new(ephemeral, Arc::clone(&store), config.queue.clone()),
            directory: AgentDirectory::new(Arc::clone(&store), config.directory.clone()),
            store,
            config: config.tasks.clone(),
        }
    }

    /// The agent registry.
    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    /// The priority queue, sole owner of the ephemeral store.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Create a task and queue it on the healthiest capable agent.
    ///
    /// Returns `None` when no active agent supports the task type. An agent
    /// already at its concurrency limit still receives the task, at low priority.
    pub async fn create_task(&self, request: NewTask) -> RelayResult<Option<Task>> {
        request.validate(self.config.max_timeout_secs)?;

        let candidates = self.directory.find_capable(&request.task_type).await?;
        let Some(agent) = select_agent(candidates) else {
            warn!(task_type = %request.task_type, "No capable agent for task");
            return Ok(None);
        };
        let priority = self.admission_priority(&agent, request.priority).await?;

        let mut task = Task::new(
            agent.id,
            request.task_type,
            request.context,
            request
                .timeout_seconds
                .unwrap_or(self.config.default_timeout_secs),
            self.config.default_max_retries,
        );
        task.payload = request.payload;
        task.correlation_id = request.correlation_id;
        self.store.insert_task(&task).await?;

        let queued = self
            .queue
            .enqueue(agent.id, task.id, &task.task_type, &task.context, priority)
            .await?;
        info!(
            task_id = %queued.id,
            agent_id = %agent.id,
            task_type = %queued.task_type,
            priority = %priority,
            "Task created"
        );
        Ok(Some(queued))
    }

    /// Hand the next task to a polling agent. Agents that are not active get nothing.
    pub async fn next_task(&self, agent_id: Uuid) -> RelayResult<Option<Task>> {
        let agent = self.directory.get(agent_id).await?;
        if agent.status != AgentStatus::Active {
            return Ok(None);
        }
        Ok(self.queue.dequeue(agent_id).await?.map(|d| d.task))
    }

    /// Record progress reported by the executing agent.
    pub async fn update_progress(
        &self,
        task_id: Uuid,
        progress: f64,
        metrics: Option<JsonMap>,
    ) -> RelayResult<Task> {
        if !progress.is_finite() || !(0.0..=1.0).contains(&progress) {
            return Err(RelayError::InvalidInput(format!(
                "progress must be within [0, 1], got {progress}"
            )));
        }
        self.store
            .modify_task(
                task_id,
                Box::new(move |task| {
                    task.progress = progress;
                    if let Some(metrics) = metrics {
                        task.metrics.extend(metrics);
                    }
                    task.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| RelayError::task_not_found(task_id))
    }

    /// Record an agent's completion report.
    ///
    /// Failures with retry budget left are re-queued automatically. A report
    /// for a task that is no longer running changes nothing.
    pub async fn complete_task(&self, task_id: Uuid, outcome: TaskOutcome) -> RelayResult<Task> {
        let success = outcome.success;
        let completion = self.queue.complete(task_id, outcome).await?;
        if !completion.applied {
            return Ok(completion.task);
        }

        let task = completion.task;
        self.store
            .record_task_outcome(task.agent_id, success)
            .await?;
        if success {
            return Ok(task);
        }
        self.retry_if_budget(task).await
    }

    /// Withdraw a task; a later completion report is ignored.
    pub async fn cancel_task(&self, task_id: Uuid) -> RelayResult<Task> {
        self.queue.cancel(task_id).await
    }

    /// Operator retry of a failed task.
    pub async fn retry_task(&self, task_id: Uuid) -> RelayResult<Task> {
        self.queue.retry(task_id, Priority::Normal).await
    }

    /// Move a task to `new_agent_id`, or to the best capable agent when omitted.
    pub async fn reassign_task(
        &self,
        task_id: Uuid,
        new_agent_id: Option<Uuid>,
    ) -> RelayResult<Task> {
        let task = self.get_task(task_id).await?;
        let agent = match new_agent_id {
            Some(agent_id) => {
                let agent = self.directory.get(agent_id).await?;
                if !agent.capabilities.supports(&task.task_type) {
                    return Err(RelayError::InvalidInput(format!(
                        "agent '{}' does not support task type '{}'",
                        agent.name, task.task_type
                    )));
                }
                agent
            }
            None => select_agent(self.directory.find_capable(&task.task_type).await?)
                .ok_or_else(|| RelayError::NoCapableAgent(task.task_type.clone()))?,
        };
        let priority = self.admission_priority(&agent, Priority::Normal).await?;
        self.queue.reassign(task_id, agent.id, priority).await
    }

    /// Fetch one task.
    pub async fn get_task(&self, task_id: Uuid) -> RelayResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| RelayError::task_not_found(task_id))
    }

    /// List tasks matching `filter`, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> RelayResult<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    /// Every task linked to an originating decision, newest first.
    pub async fn get_tasks_by_correlation(&self, correlation_id: Uuid) -> RelayResult<Vec<Task>> {
        self.store
            .list_tasks(&TaskFilter {
                correlation_id: Some(correlation_id),
                limit: None,
                ..Default::default()
            })
            .await
    }

    /// Capacity, health and queue depth of one agent.
    pub async fn get_agent_queue_status(&self, agent_id: Uuid) -> RelayResult<AgentQueueStatus> {
        let agent = self.directory.get(agent_id).await?;
        let active_tasks = self.queue.active_tasks(agent_id).await?.len();
        let queue_depth = self.queue.queue_depth(agent_id).await?;
        let max = agent.capabilities.max_concurrent_tasks as usize;
        Ok(AgentQueueStatus {
            agent_id,
            agent_name: agent.name,
            status: agent.status,
            health_score: agent.health_score,
            max_concurrent_tasks: agent.capabilities.max_concurrent_tasks,
            active_tasks,
            available_capacity: max.saturating_sub(active_tasks),
            queue_depth,
        })
    }

    /// Counts per status, mean duration of completed tasks and success rate.
    pub async fn get_task_statistics(&self, agent_id: Option<Uuid>) -> RelayResult<TaskStatistics> {
        let rows = self.store.summarize_tasks(agent_id).await?;
        Ok(TaskStatistics::from_summaries(&rows))
    }

    /// Sweep overdue tasks and apply the failure policy to each.
    ///
    /// Returns the tasks as they stand afterwards: failed, or queued again.
    pub async fn check_task_timeouts(&self) -> RelayResult<Vec<Task>> {
        let timed_out = self.queue.check_timeouts().await?;
        let mut handled = Vec::with_capacity(timed_out.len());
        for task in timed_out {
            match self.store.record_task_outcome(task.agent_id, false).await {
                Ok(()) | Err(RelayError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            handled.push(self.retry_if_budget(task).await?);
        }
        if !handled.is_empty() {
            info!(count = handled.len(), "Timeout sweep handled tasks");
        }
        Ok(handled)
    }

    /// Purge an agent's queue state, then delete it along with its tasks.
    pub async fn unregister_agent(&self, agent_id: Uuid) -> RelayResult<()> {
        self.directory.get(agent_id).await?;
        self.queue.purge_agent(agent_id).await?;
        self.directory.delete(agent_id).await
    }

    async fn retry_if_budget(&self, task: Task) -> RelayResult<Task> {
        if task.status != TaskStatus::Failed || !task.has_retry_budget() {
            if task.status == TaskStatus::Failed {
                warn!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    "Task failed with retry budget exhausted"
                );
            }
            return Ok(task);
        }
        self.queue.retry(task.id, Priority::Normal).await
    }

    /// Requested priority, or low when the agent is already at capacity.
    async fn admission_priority(&self, agent: &Agent, requested: Priority) -> RelayResult<Priority> {
        let active = self.queue.active_tasks(agent.id).await?.len();
        if active >= agent.capabilities.max_concurrent_tasks as usize {
            warn!(
                agent_id = %agent.id,
                active,
                max_concurrent_tasks = agent.capabilities.max_concurrent_tasks,
                "Agent at capacity, queueing at low priority"
            );
            return Ok(Priority::Low);
        }
        Ok(requested)
    }
}

/// Highest health score wins; ties go to the lowest id.
fn select_agent(candidates: Vec<Agent>) -> Option<Agent> {
    candidates.into_iter().min_by(|a, b| {
        b.health_score
            .total_cmp(&a.health_score)
            .then_with(|| a.id.cmp(&b.id))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ephemeral::MemoryEphemeralStore;
    use relay_core::{AgentCapabilities, Heartbeat, NewAgent};
    use relay_store::SqliteStore;

    fn manager() -> TaskManager {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        TaskManager::new(
            store,
            Box::new(MemoryEphemeralStore::new()),
            &RelayConfig::default(),
        )
    }

    async fn register(m: &TaskManager, name: &str) -> Agent {
        m.directory()
            .register(NewAgent::new(
                name,
                "1.0.0",
                AgentCapabilities::new(["ci_failure_fix"]),
            ))
            .await
            .unwrap()
    }

    fn request() -> NewTask {
        let mut context = JsonMap::new();
        context.insert("repo".into(), serde_json::json!("org/service"));
        NewTask::new("ci_failure_fix", context)
    }

    #[test]
    fn test_select_agent_breaks_ties_by_id() {
        let mut a = Agent::from_registration(NewAgent::new(
            "fixer-a",
            "1.0.0",
            AgentCapabilities::new(["x"]),
        ));
        let mut b = a.clone();
        a.id = Uuid::from_u128(2);
        b.id = Uuid::from_u128(1);
        let chosen = select_agent(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(chosen.id, b.id);

        a.health_score = 1.0;
        b.health_score = 0.5;
        let chosen = select_agent(vec![a.clone(), b]).unwrap();
        assert_eq!(chosen.id, a.id);
        assert!(select_agent(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn test_create_picks_healthiest() {
        let m = manager();
        let weak = register(&m, "fixer-a").await;
        let strong = register(&m, "fixer-b").await;
        m.directory()
            .heartbeat(weak.id, Heartbeat::new(0.5))
            .await
            .unwrap();
        m.directory()
            .heartbeat(strong.id, Heartbeat::new(0.9))
            .await
            .unwrap();

        let task = m.create_task(request()).await.unwrap().unwrap();
        assert_eq!(task.agent_id, strong.id);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.timeout_seconds, 600);
        assert_eq!(task.max_retries, 3);
    }

    #[tokio::test]
    async fn test_create_without_capable_agent() {
        let m = manager();
        assert!(m.create_task(request()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_timeout() {
        let m = manager();
        register(&m, "fixer-a").await;
        let err = m
            .create_task(request().with_timeout(7200))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_next_task_for_paused_agent_is_none() {
        let m = manager();
        let agent = register(&m, "fixer-a").await;
        m.create_task(request()).await.unwrap().unwrap();
        m.directory()
            .update(
                agent.id,
                relay_core::AgentUpdate {
                    status: Some(AgentStatus::Paused),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(m.next_task(agent.id).await.unwrap().is_none());
        assert!(m.next_task(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_and_success_counters() {
        let m = manager();
        let agent = register(&m, "fixer-a").await;
        let task = m.create_task(request()).await.unwrap().unwrap();
        m.next_task(agent.id).await.unwrap().unwrap();

        let mut metrics = JsonMap::new();
        metrics.insert("files".into(), serde_json::json!(3));
        let progressed = m
            .update_progress(task.id, 0.5, Some(metrics))
            .await
            .unwrap();
        assert_eq!(progressed.progress, 0.5);
        assert!(m.update_progress(task.id, 1.5, None).await.is_err());

        let done = m
            .complete_task(task.id, TaskOutcome::success(None))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.metrics["files"], 3);

        let agent = m.directory().get(agent.id).await.unwrap();
        assert_eq!((agent.total_tasks, agent.successful_tasks), (1, 1));

        let stats = m.get_task_statistics(Some(agent.id)).await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_failure_is_retried_automatically() {
        let m = manager();
        let agent = register(&m, "fixer-a").await;
        let task = m.create_task(request()).await.unwrap().unwrap();
        m.next_task(agent.id).await.unwrap().unwrap();

        let retried = m
            .complete_task(task.id, TaskOutcome::failure("tests still red"))
            .await
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Queued);
        assert_eq!(retried.retry_count, 1);

        let agent = m.directory().get(agent.id).await.unwrap();
        assert_eq!(agent.failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_late_completion_does_not_count() {
        let m = manager();
        let agent = register(&m, "fixer-a").await;
        let task = m.create_task(request()).await.unwrap().unwrap();
        m.next_task(agent.id).await.unwrap().unwrap();
        m.cancel_task(task.id).await.unwrap();

        let late = m
            .complete_task(task.id, TaskOutcome::success(None))
            .await
            .unwrap();
        assert_eq!(late.status, TaskStatus::Cancelled);
        assert_eq!(m.directory().get(agent.id).await.unwrap().total_tasks, 0);
    }

    #[tokio::test]
    async fn test_reassign_moves_task() {
        let m = manager();
        let first = register(&m, "fixer-a").await;
        let task = m.create_task(request()).await.unwrap().unwrap();
        assert_eq!(task.agent_id, first.id);
        let second = register(&m, "fixer-b").await;

        let moved = m.reassign_task(task.id, Some(second.id)).await.unwrap();
        assert_eq!(moved.agent_id, second.id);
        assert_eq!(moved.retry_count, 1);
        assert_eq!(moved.status, TaskStatus::Queued);
        assert_eq!(m.queue().queue_depth(first.id).await.unwrap().total, 0);
        assert_eq!(m.queue().queue_depth(second.id).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_reassign_respects_retry_budget() {
        let mut config = RelayConfig::default();
        config.tasks.default_max_retries = 1;
        let m = TaskManager::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Box::new(MemoryEphemeralStore::new()),
            &config,
        );
        register(&m, "fixer-a").await;
        register(&m, "fixer-b").await;
        let task = m.create_task(request()).await.unwrap().unwrap();

        let moved = m.reassign_task(task.id, None).await.unwrap();
        assert_eq!(moved.retry_count, 1);

        let err = m.reassign_task(task.id, None).await.unwrap_err();
        assert!(matches!(err, RelayError::RetryBudgetExhausted { .. }));

        let current = m.get_task(task.id).await.unwrap();
        assert_eq!(current.retry_count, 1);
        assert_eq!(current.status, TaskStatus::Queued);
        let depth = m.queue().queue_depth(current.agent_id).await.unwrap();
        assert_eq!(depth.total, 1);
    }

    #[tokio::test]
    async fn test_correlation_lookup() {
        let m = manager();
        register(&m, "fixer-a").await;
        let correlation = Uuid::new_v4();
        let a = m
            .create_task(request().with_correlation(correlation))
            .await
            .unwrap()
            .unwrap();
        m.create_task(request()).await.unwrap().unwrap();

        let linked = m.get_tasks_by_correlation(correlation).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, a.id);
    }

    #[tokio::test]
    async fn test_agent_queue_status() {
        let m = manager();
        let agent = register(&m, "fixer-a").await;
        m.create_task(request()).await.unwrap().unwrap();
        m.create_task(request().with_priority(Priority::High))
            .await
            .unwrap()
            .unwrap();
        m.next_task(agent.id).await.unwrap().unwrap();

        let status = m.get_agent_queue_status(agent.id).await.unwrap();
        assert_eq!(status.active_tasks, 1);
        assert_eq!(status.available_capacity, 4);
        assert_eq!(status.queue_depth.normal, 1);
        assert_eq!(status.queue_depth.high, 0);
    }

    #[tokio::test]
    async fn test_unregister_removes_everything() {
        let m = manager();
        let agent = register(&m, "fixer-a").await;
        let task = m.create_task(request()).await.unwrap().unwrap();

        m.unregister_agent(agent.id).await.unwrap();
        assert!(m.get_task(task.id).await.is_err());
        assert_eq!(m.queue().queue_depth(agent.id).await.unwrap().total, 0);
        assert!(m.unregister_agent(agent.id).await.is_err());
    }
}
