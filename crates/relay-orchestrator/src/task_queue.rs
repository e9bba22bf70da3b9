use crate::config::QueueConfig;
use crate::ephemeral::{EphemeralStore, TierKey};
use chrono::{DateTime, Utc};
use relay_core::{
    JsonMap, Priority, RelayError, RelayResult, Task, TaskFilter, TaskOutcome, TaskStatus,
};
use relay_store::{DurableStore, TaskMutation, TaskStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Candidates examined per tier on one dequeue.
const DEQUEUE_SCAN: usize = 32;

/// Ephemeral record stored per queued task.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedPayload {
    task_id: Uuid,
    agent_id: Uuid,
    task_type: String,
    context: JsonMap,
    priority: Priority,
    enqueued_at: DateTime<Utc>,
}

/// A task handed to a polling agent.
#[derive(Debug, Clone)]
pub struct DequeuedTask {
    /// Durable record, already marked running.
    pub task: Task,
    /// Tier the task was claimed from.
    pub priority: Priority,
    /// When the task entered that tier.
    pub enqueued_at: DateTime<Utc>,
}

/// Result of [`TaskQueue::complete`].
#[derive(Debug, Clone)]
pub struct Completion {
    /// Durable record after the call.
    pub task: Task,
    /// `false` when the task was no longer running and nothing was written.
    pub applied: bool,
}

/// Queued entries of one agent, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Entries in the high tier.
    pub high: usize,
    /// Entries in the normal tier.
    pub normal: usize,
    /// Entries in the low tier.
    pub low: usize,
    /// Sum of all tiers.
    pub total: usize,
}

/// Every ephemeral trace a task currently has.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResidue {
    /// Tiers of the owning agent that still hold the task.
    pub tiers: Vec<Priority>,
    /// Whether the task is in its agent's assignment set.
    pub assigned: bool,
    /// Whether a live dequeue lock exists.
    pub locked: bool,
    /// Whether a live payload record exists.
    pub payload: bool,
}

impl TaskResidue {
    /// No trace left in the queue store.
    pub fn is_clear(&self) -> bool {
        self.tiers.is_empty() && !self.assigned && !self.locked && !self.payload
    }
}

/// Outcome of [`TaskQueue::rehydrate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RehydrateReport {
    /// Pending and queued tasks put back into a tier.
    pub requeued: usize,
    /// Running tasks whose lock and assignment were restored.
    pub restored_running: usize,
}

/// Priority queue distributing tasks to worker agents.
///
/// The only owner of the ephemeral queue/lock store. Each operation performs
/// its ephemeral steps first and writes the durable record afterwards; if the
/// durable write fails the ephemeral steps are withdrawn. [`TaskQueue::check_timeouts`]
/// is the one path that writes the durable record unilaterally.
pub struct TaskQueue {
    ephemeral: Box<dyn EphemeralStore>,
    store: Arc<dyn DurableStore>,
    config: QueueConfig,
}

impl TaskQueue {
    /// Take sole ownership of `ephemeral`; `store` is shared with the rest of the system.
    pub fn new(
        ephemeral: Box<dyn EphemeralStore>,
        store: Arc<dyn DurableStore>,
        config: QueueConfig,
    ) -> Self {
        Self {
            ephemeral,
            store,
            config,
        }
    }

    /// Place a pending (or already queued) task into the agent's `priority` tier
    /// and mark it queued.
    ///
    /// Enqueuing the same task again moves it rather than duplicating it.
    pub async fn enqueue(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        task_type: &str,
        context: &JsonMap,
        priority: Priority,
    ) -> RelayResult<Task> {
        let task = self
            .place(
                agent_id,
                task_id,
                task_type,
                context,
                priority,
                Box::new(move |task| {
                    if matches!(
                        task.status,
                        TaskStatus::Pending | TaskStatus::Queued | TaskStatus::RateLimited
                    ) {
                        Ok(())
                    } else {
                        Err(RelayError::InvalidTransition {
                            task_id,
                            from: task.status,
                            to: TaskStatus::Queued,
                        })
                    }
                }),
            )
            .await?;
        info!(task_id = %task_id, agent_id = %agent_id, priority = %priority, "Task queued");
        Ok(task)
    }

    /// Claim the oldest task of the highest non-empty tier for `agent_id`.
    ///
    /// Lock contention is not an error: the next candidate is tried.
    pub async fn dequeue(&self, agent_id: Uuid) -> RelayResult<Option<DequeuedTask>> {
        for priority in Priority::DRAIN_ORDER {
            let key = TierKey::new(agent_id, priority);
            let candidates = self.ephemeral.tier_range(key, DEQUEUE_SCAN).await?;
            for task_id in candidates {
                if let Some(claimed) = self.claim(key, task_id).await? {
                    return Ok(Some(claimed));
                }
            }
        }
        Ok(None)
    }

    async fn claim(&self, key: TierKey, task_id: Uuid) -> RelayResult<Option<DequeuedTask>> {
        let agent_id = key.agent_id;
        if !self.ephemeral.try_lock(task_id, self.config.lock_ttl()).await? {
            debug!(task_id = %task_id, "Task locked by another poller, trying next");
            return Ok(None);
        }
        if !self.ephemeral.tier_remove(key, task_id).await? {
            self.ephemeral.unlock(task_id).await?;
            debug!(task_id = %task_id, "Task left the tier before it could be claimed");
            return Ok(None);
        }
        // The durable record carries the context too, so a lost payload only
        // loses the recorded enqueue time.
        let (priority, enqueued_at) = match self.ephemeral.get_payload(task_id).await? {
            Some(raw) => match serde_json::from_str::<QueuedPayload>(&raw) {
                Ok(payload) => (payload.priority, payload.enqueued_at),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Unreadable queue payload");
                    (key.priority, Utc::now())
                }
            },
            None => {
                debug!(task_id = %task_id, "Queue payload expired");
                (key.priority, Utc::now())
            }
        };
        self.ephemeral.assign(agent_id, task_id).await?;

        let now = Utc::now();
        let marked = self
            .store
            .modify_task(
                task_id,
                Box::new(move |task| {
                    if !matches!(task.status, TaskStatus::Queued | TaskStatus::Pending) {
                        return Err(RelayError::InvalidTransition {
                            task_id,
                            from: task.status,
                            to: TaskStatus::Running,
                        });
                    }
                    task.mark_running(now);
                    Ok(())
                }),
            )
            .await;

        match marked {
            Ok(Some(task)) => {
                info!(
                    task_id = %task_id,
                    agent_id = %agent_id,
                    priority = %priority,
                    "Task dequeued"
                );
                Ok(Some(DequeuedTask {
                    task,
                    priority,
                    enqueued_at,
                }))
            }
            Ok(None) | Err(RelayError::InvalidTransition { .. }) => {
                // Stale entry: the durable record is gone or moved on.
                debug!(task_id = %task_id, "Dropping stale queue entry");
                self.release(agent_id, task_id).await?;
                Ok(None)
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to mark task running");
                self.ephemeral.unassign(agent_id, task_id).await?;
                self.ephemeral.tier_insert(key, task_id, enqueued_at).await?;
                self.ephemeral.unlock(task_id).await?;
                Err(e)
            }
        }
    }

    /// Record the outcome of a running task.
    ///
    /// A task that is no longer running (cancelled, timed out, already
    /// finished) is left untouched and reported with `applied = false`.
    pub async fn complete(&self, task_id: Uuid, outcome: TaskOutcome) -> RelayResult<Completion> {
        let task = self.require_task(task_id).await?;
        if task.status != TaskStatus::Running {
            warn!(task_id = %task_id, status = %task.status, "Ignoring completion of task that is not running");
            return Ok(Completion {
                task,
                applied: false,
            });
        }

        self.ephemeral.unlock(task_id).await?;
        self.ephemeral.unassign(task.agent_id, task_id).await?;
        self.ephemeral.delete_payload(task_id).await?;

        let success = outcome.success;
        let now = Utc::now();
        let written = self
            .store
            .modify_task(
                task_id,
                Box::new(move |task| {
                    if task.status != TaskStatus::Running {
                        return Err(RelayError::InvalidTransition {
                            task_id,
                            from: task.status,
                            to: if success {
                                TaskStatus::Completed
                            } else {
                                TaskStatus::Failed
                            },
                        });
                    }
                    apply_outcome(task, outcome, now);
                    Ok(())
                }),
            )
            .await;

        match written {
            Ok(Some(task)) => {
                info!(task_id = %task_id, status = %task.status, duration_ms = ?task.duration_ms, "Task finished");
                Ok(Completion {
                    task,
                    applied: true,
                })
            }
            Ok(None) => Err(RelayError::task_not_found(task_id)),
            Err(RelayError::InvalidTransition { .. }) => {
                let task = self.require_task(task_id).await?;
                warn!(task_id = %task_id, status = %task.status, "Task changed state before completion was recorded");
                Ok(Completion {
                    task,
                    applied: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Put a failed task back in the queue, consuming one retry.
    pub async fn retry(&self, task_id: Uuid, priority: Priority) -> RelayResult<Task> {
        let task = self.require_task(task_id).await?;
        check_retryable(&task)?;

        let retried = self
            .place(
                task.agent_id,
                task_id,
                &task.task_type,
                &task.context,
                priority,
                Box::new(move |task| {
                    check_retryable(task)?;
                    task.retry_count += 1;
                    reset_attempt(task);
                    Ok(())
                }),
            )
            .await?;
        info!(
            task_id = %task_id,
            retry_count = retried.retry_count,
            max_retries = retried.max_retries,
            "Task re-queued for retry"
        );
        Ok(retried)
    }

    /// Move a task to another agent, consuming one retry.
    ///
    /// Accepts any status except completed while retry budget remains;
    /// ephemeral traces under the old agent are released first.
    pub async fn reassign(
        &self,
        task_id: Uuid,
        new_agent_id: Uuid,
        priority: Priority,
    ) -> RelayResult<Task> {
        let task = self.require_task(task_id).await?;
        check_reassignable(&task)?;
        self.release(task.agent_id, task_id).await?;

        let moved = self
            .place(
                new_agent_id,
                task_id,
                &task.task_type,
                &task.context,
                priority,
                Box::new(move |task| {
                    check_reassignable(task)?;
                    task.retry_count += 1;
                    reset_attempt(task);
                    Ok(())
                }),
            )
            .await?;
        info!(
            task_id = %task_id,
            from_agent = %task.agent_id,
            to_agent = %new_agent_id,
            "Task reassigned"
        );
        Ok(moved)
    }

    /// Withdraw a pending, queued or running task.
    ///
    /// The executing agent is not notified; a later completion is ignored.
    pub async fn cancel(&self, task_id: Uuid) -> RelayResult<Task> {
        let task = self.require_task(task_id).await?;
        if !task.status.is_cancellable() {
            return Err(RelayError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Cancelled,
            });
        }
        self.release(task.agent_id, task_id).await?;

        let now = Utc::now();
        let cancelled = self
            .store
            .modify_task(
                task_id,
                Box::new(move |task| {
                    if !task.status.is_cancellable() {
                        return Err(RelayError::InvalidTransition {
                            task_id,
                            from: task.status,
                            to: TaskStatus::Cancelled,
                        });
                    }
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(now);
                    task.updated_at = now;
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| RelayError::task_not_found(task_id))?;
        info!(task_id = %task_id, agent_id = %cancelled.agent_id, "Task cancelled");
        Ok(cancelled)
    }

    /// Queued entries of `agent_id`, per tier.
    pub async fn queue_depth(&self, agent_id: Uuid) -> RelayResult<QueueDepth> {
        let high = self
            .ephemeral
            .tier_len(TierKey::new(agent_id, Priority::High))
            .await?;
        let normal = self
            .ephemeral
            .tier_len(TierKey::new(agent_id, Priority::Normal))
            .await?;
        let low = self
            .ephemeral
            .tier_len(TierKey::new(agent_id, Priority::Low))
            .await?;
        Ok(QueueDepth {
            high,
            normal,
            low,
            total: high + normal + low,
        })
    }

    /// Task ids currently checked out by `agent_id`.
    pub async fn active_tasks(&self, agent_id: Uuid) -> RelayResult<Vec<Uuid>> {
        self.ephemeral.assignments(agent_id).await
    }

    /// Fail every running task whose execution budget has elapsed.
    ///
    /// The listing may be stale by the time a task is visited, so the durable
    /// record is re-checked inside the write and the lease is only released
    /// for tasks this sweep actually failed. Release is best-effort: the
    /// durable record is corrected even when the queue/lock store cannot be
    /// reached. Returns the failed tasks so the caller can decide on retries.
    pub async fn check_timeouts(&self) -> RelayResult<Vec<Task>> {
        let now = Utc::now();
        let running = self
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::Running))
            .await?;

        let mut timed_out = Vec::new();
        for task in running.into_iter().filter(|t| t.is_overdue(now)) {
            let task_id = task.id;
            let reason = RelayError::Timeout(task_id).to_string();
            let written = self
                .store
                .modify_task(
                    task_id,
                    Box::new(move |task| {
                        if !task.is_overdue(now) {
                            return Err(RelayError::InvalidTransition {
                                task_id,
                                from: task.status,
                                to: TaskStatus::Failed,
                            });
                        }
                        task.mark_finished(false, now);
                        task.error_message = Some(format!(
                            "{reason} after {} seconds",
                            task.timeout_seconds
                        ));
                        Ok(())
                    }),
                )
                .await;
            match written {
                Ok(Some(task)) => {
                    warn!(task_id = %task_id, agent_id = %task.agent_id, timeout_seconds = task.timeout_seconds, "Task timed out");
                    if let Err(e) = self.release_lease(task.agent_id, task_id).await {
                        warn!(task_id = %task_id, error = %e, "Could not release timed-out task from the queue store");
                    }
                    timed_out.push(task);
                }
                Ok(None) | Err(RelayError::InvalidTransition { .. }) => {
                    debug!(task_id = %task_id, "Task left running state during timeout sweep");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(timed_out)
    }

    /// Every ephemeral trace of a task.
    pub async fn residue(&self, task_id: Uuid) -> RelayResult<TaskResidue> {
        let task = self.require_task(task_id).await?;
        let mut tiers = Vec::new();
        for priority in Priority::DRAIN_ORDER {
            let members = self
                .ephemeral
                .tier_range(TierKey::new(task.agent_id, priority), usize::MAX)
                .await?;
            if members.contains(&task_id) {
                tiers.push(priority);
            }
        }
        Ok(TaskResidue {
            tiers,
            assigned: self
                .ephemeral
                .assignments(task.agent_id)
                .await?
                .contains(&task_id),
            locked: self.ephemeral.is_locked(task_id).await?,
            payload: self.ephemeral.get_payload(task_id).await?.is_some(),
        })
    }

    /// Rebuild ephemeral state from the durable store, e.g. after a restart.
    ///
    /// Pending and queued tasks go back into the normal tier in creation order;
    /// running tasks get their lock and assignment back.
    pub async fn rehydrate(&self) -> RelayResult<RehydrateReport> {
        let mut waiting = self
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::Pending))
            .await?;
        waiting.extend(
            self.store
                .list_tasks(&TaskFilter::with_status(TaskStatus::Queued))
                .await?,
        );
        waiting.sort_by_key(|t| (t.created_at, t.id));

        let mut report = RehydrateReport::default();
        for task in &waiting {
            self.enqueue(
                task.agent_id,
                task.id,
                &task.task_type,
                &task.context,
                Priority::Normal,
            )
            .await?;
            report.requeued += 1;
        }

        let running = self
            .store
            .list_tasks(&TaskFilter::with_status(TaskStatus::Running))
            .await?;
        for task in &running {
            self.ephemeral
                .try_lock(task.id, self.config.lock_ttl())
                .await?;
            self.ephemeral.assign(task.agent_id, task.id).await?;
            report.restored_running += 1;
        }
        info!(
            requeued = report.requeued,
            restored_running = report.restored_running,
            "Queue rehydrated from durable store"
        );
        Ok(report)
    }

    /// Reclaim expired payloads and locks from the queue store.
    pub async fn purge_expired(&self) -> RelayResult<usize> {
        self.ephemeral.purge_expired().await
    }

    /// Remove every ephemeral trace of an agent's tasks. Returns how many tasks were touched.
    pub async fn purge_agent(&self, agent_id: Uuid) -> RelayResult<usize> {
        let mut purged = 0;
        for priority in Priority::DRAIN_ORDER {
            let key = TierKey::new(agent_id, priority);
            for task_id in self.ephemeral.tier_range(key, usize::MAX).await? {
                self.ephemeral.tier_remove(key, task_id).await?;
                self.ephemeral.delete_payload(task_id).await?;
                purged += 1;
            }
        }
        for task_id in self.ephemeral.assignments(agent_id).await? {
            self.ephemeral.unassign(agent_id, task_id).await?;
            self.ephemeral.unlock(task_id).await?;
            self.ephemeral.delete_payload(task_id).await?;
            purged += 1;
        }
        if purged > 0 {
            info!(agent_id = %agent_id, purged, "Purged agent from queue store");
        }
        Ok(purged)
    }

    /// Write the ephemeral entry, then the durable `queued` record.
    async fn place(
        &self,
        agent_id: Uuid,
        task_id: Uuid,
        task_type: &str,
        context: &JsonMap,
        priority: Priority,
        prepare: TaskMutation,
    ) -> RelayResult<Task> {
        for other in Priority::DRAIN_ORDER.into_iter().filter(|p| *p != priority) {
            self.ephemeral
                .tier_remove(TierKey::new(agent_id, other), task_id)
                .await?;
        }
        self.ephemeral.unassign(agent_id, task_id).await?;

        let now = Utc::now();
        let payload = QueuedPayload {
            task_id,
            agent_id,
            task_type: task_type.to_string(),
            context: context.clone(),
            priority,
            enqueued_at: now,
        };
        let key = TierKey::new(agent_id, priority);
        self.ephemeral
            .put_payload(
                task_id,
                serde_json::to_string(&payload)?,
                self.config.payload_ttl(),
            )
            .await?;
        self.ephemeral.tier_insert(key, task_id, now).await?;

        let written = self
            .store
            .modify_task(
                task_id,
                Box::new(move |task| {
                    prepare(task)?;
                    task.agent_id = agent_id;
                    task.status = TaskStatus::Queued;
                    task.updated_at = now;
                    Ok(())
                }),
            )
            .await;

        match written {
            Ok(Some(task)) => Ok(task),
            outcome => {
                self.ephemeral.tier_remove(key, task_id).await?;
                self.ephemeral.delete_payload(task_id).await?;
                match outcome {
                    Ok(_) => Err(RelayError::task_not_found(task_id)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drop every ephemeral trace of a task under `agent_id`.
    async fn release(&self, agent_id: Uuid, task_id: Uuid) -> RelayResult<()> {
        for priority in Priority::DRAIN_ORDER {
            self.ephemeral
                .tier_remove(TierKey::new(agent_id, priority), task_id)
                .await?;
        }
        self.release_lease(agent_id, task_id).await
    }

    /// Drop the lock, assignment and payload of a checked-out task. Tiers are
    /// left alone: a claimed task has already left them.
    async fn release_lease(&self, agent_id: Uuid, task_id: Uuid) -> RelayResult<()> {
        self.ephemeral.unlock(task_id).await?;
        self.ephemeral.unassign(agent_id, task_id).await?;
        self.ephemeral.delete_payload(task_id).await?;
        Ok(())
    }

    async fn require_task(&self, task_id: Uuid) -> RelayResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| RelayError::task_not_found(task_id))
    }
}

fn check_retryable(task: &Task) -> RelayResult<()> {
    if task.status != TaskStatus::Failed {
        return Err(RelayError::InvalidTransition {
            task_id: task.id,
            from: task.status,
            to: TaskStatus::Queued,
        });
    }
    if !task.has_retry_budget() {
        return Err(RelayError::RetryBudgetExhausted {
            task_id: task.id,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        });
    }
    Ok(())
}

fn check_reassignable(task: &Task) -> RelayResult<()> {
    if task.status == TaskStatus::Completed {
        return Err(RelayError::InvalidTransition {
            task_id: task.id,
            from: task.status,
            to: TaskStatus::Queued,
        });
    }
    if !task.has_retry_budget() {
        return Err(RelayError::RetryBudgetExhausted {
            task_id: task.id,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        });
    }
    Ok(())
}

/// Clear per-attempt fields so the next run gets a fresh execution budget.
fn reset_attempt(task: &mut Task) {
    task.status = TaskStatus::Pending;
    task.progress = 0.0;
    task.started_at = None;
    task.completed_at = None;
    task.duration_ms = None;
}

fn apply_outcome(task: &mut Task, outcome: TaskOutcome, now: DateTime<Utc>) {
    task.mark_finished(outcome.success, now);
    if outcome.success {
        task.progress = 1.0;
        task.error_message = None;
    } else {
        task.error_message = outcome.error;
    }
    if outcome.result.is_some() {
        task.result = outcome.result;
    }
    task.artifacts.extend(outcome.artifacts);
    if let Some(metrics) = outcome.metrics {
        task.metrics.extend(metrics);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ephemeral::MemoryEphemeralStore;
    use relay_core::{Agent, AgentCapabilities, NewAgent};
    use relay_store::{AgentStore, SqliteStore, TaskStore};

    async fn setup() -> (TaskQueue, Arc<SqliteStore>, Agent) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let agent = Agent::from_registration(NewAgent::new(
            "patchbot",
            "1.0.0",
            AgentCapabilities::new(["ci_failure_fix"]),
        ));
        store.insert_agent(&agent).await.unwrap();
        let queue = TaskQueue::new(
            Box::new(MemoryEphemeralStore::new()),
            store.clone(),
            QueueConfig::default(),
        );
        (queue, store, agent)
    }

    async fn pending(store: &SqliteStore, agent: &Agent, max_retries: u32) -> Task {
        let task = Task::new(agent.id, "ci_failure_fix", JsonMap::new(), 600, max_retries);
        store.insert_task(&task).await.unwrap();
        task
    }

    async fn queued(queue: &TaskQueue, store: &SqliteStore, agent: &Agent, p: Priority) -> Task {
        let task = pending(store, agent, 3).await;
        queue
            .enqueue(agent.id, task.id, &task.task_type, &task.context, p)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_marks_queued() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        assert_eq!(task.status, TaskStatus::Queued);

        let depth = queue.queue_depth(agent.id).await.unwrap();
        assert_eq!(depth.normal, 1);
        assert_eq!(depth.total, 1);
    }

    #[tokio::test]
    async fn test_reenqueue_keeps_single_tier() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        queue
            .enqueue(agent.id, task.id, &task.task_type, &task.context, Priority::High)
            .await
            .unwrap();

        let residue = queue.residue(task.id).await.unwrap();
        assert_eq!(residue.tiers, vec![Priority::High]);
        assert_eq!(queue.queue_depth(agent.id).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_task_leaves_no_entry() {
        let (queue, _store, agent) = setup().await;
        let err = queue
            .enqueue(
                agent.id,
                Uuid::new_v4(),
                "ci_failure_fix",
                &JsonMap::new(),
                Priority::Normal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound { kind: "task", .. }));
        assert_eq!(queue.queue_depth(agent.id).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_dequeue_fifo_within_tier() {
        let (queue, store, agent) = setup().await;
        let first = queued(&queue, &store, &agent, Priority::Normal).await;
        let second = queued(&queue, &store, &agent, Priority::Normal).await;

        let a = queue.dequeue(agent.id).await.unwrap().unwrap();
        let b = queue.dequeue(agent.id).await.unwrap().unwrap();
        assert_eq!(a.task.id, first.id);
        assert_eq!(b.task.id, second.id);
        assert!(queue.dequeue(agent.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_marks_running_and_assigns() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Low).await;

        let claimed = queue.dequeue(agent.id).await.unwrap().unwrap();
        assert_eq!(claimed.task.status, TaskStatus::Running);
        assert!(claimed.task.started_at.is_some());
        assert_eq!(claimed.priority, Priority::Low);
        assert_eq!(queue.active_tasks(agent.id).await.unwrap(), vec![task.id]);

        let residue = queue.residue(task.id).await.unwrap();
        assert!(residue.tiers.is_empty());
        assert!(residue.assigned);
        assert!(residue.locked);
    }

    #[tokio::test]
    async fn test_dequeue_skips_cancelled_record() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        // Durable record moved on without going through the queue.
        store
            .modify_task(
                task.id,
                Box::new(|t| {
                    t.status = TaskStatus::Cancelled;
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert!(queue.dequeue(agent.id).await.unwrap().is_none());
        assert!(queue.residue(task.id).await.unwrap().is_clear());
    }

    #[tokio::test]
    async fn test_complete_records_outcome() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        queue.dequeue(agent.id).await.unwrap().unwrap();

        let mut outcome = TaskOutcome::success(Some(serde_json::json!({"pr": 7})));
        outcome.artifacts = vec![serde_json::json!("patch.diff")];
        let done = queue.complete(task.id, outcome).await.unwrap();
        assert!(done.applied);
        assert_eq!(done.task.status, TaskStatus::Completed);
        assert_eq!(done.task.progress, 1.0);
        assert!(done.task.completed_at.is_some());
        assert!(done.task.duration_ms.is_some());
        assert_eq!(done.task.artifacts.len(), 1);
        assert!(queue.residue(task.id).await.unwrap().is_clear());
    }

    #[tokio::test]
    async fn test_complete_after_cancel_is_ignored() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        queue.dequeue(agent.id).await.unwrap().unwrap();
        queue.cancel(task.id).await.unwrap();

        let late = queue
            .complete(task.id, TaskOutcome::success(None))
            .await
            .unwrap();
        assert!(!late.applied);
        assert_eq!(late.task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_budget() {
        let (queue, store, agent) = setup().await;
        let task = pending(&store, &agent, 1).await;
        queue
            .enqueue(agent.id, task.id, &task.task_type, &task.context, Priority::Normal)
            .await
            .unwrap();
        queue.dequeue(agent.id).await.unwrap().unwrap();
        queue
            .complete(task.id, TaskOutcome::failure("boom"))
            .await
            .unwrap();

        let retried = queue.retry(task.id, Priority::Normal).await.unwrap();
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.status, TaskStatus::Queued);
        assert!(retried.started_at.is_none());

        queue.dequeue(agent.id).await.unwrap().unwrap();
        queue
            .complete(task.id, TaskOutcome::failure("boom again"))
            .await
            .unwrap();
        let err = queue.retry(task.id, Priority::Normal).await.unwrap_err();
        assert!(matches!(err, RelayError::RetryBudgetExhausted { .. }));
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        let err = queue.retry(task.id, Priority::Normal).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let (queue, store, agent) = setup().await;
        let task = queued(&queue, &store, &agent, Priority::High).await;

        let cancelled = queue.cancel(task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(queue.residue(task.id).await.unwrap().is_clear());

        let again = queue.cancel(task.id).await.unwrap_err();
        assert!(matches!(again, RelayError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_rehydrate_restores_queue() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let agent = Agent::from_registration(NewAgent::new(
            "patchbot",
            "1.0.0",
            AgentCapabilities::new(["ci_failure_fix"]),
        ));
        store.insert_agent(&agent).await.unwrap();
        let first = TaskQueue::new(
            Box::new(MemoryEphemeralStore::new()),
            store.clone(),
            QueueConfig::default(),
        );
        let waiting = queued(&first, &store, &agent, Priority::Normal).await;
        let running = queued(&first, &store, &agent, Priority::High).await;
        first.dequeue(agent.id).await.unwrap().unwrap();
        drop(first);

        let restarted = TaskQueue::new(
            Box::new(MemoryEphemeralStore::new()),
            store.clone(),
            QueueConfig::default(),
        );
        let report = restarted.rehydrate().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.restored_running, 1);
        assert_eq!(restarted.active_tasks(agent.id).await.unwrap(), vec![running.id]);

        let next = restarted.dequeue(agent.id).await.unwrap().unwrap();
        assert_eq!(next.task.id, waiting.id);
    }

    #[tokio::test]
    async fn test_purge_expired_reclaims_stale_lease() {
        let (_, store, agent) = setup().await;
        let queue = TaskQueue::new(
            Box::new(MemoryEphemeralStore::new()),
            store.clone(),
            QueueConfig {
                lock_ttl_secs: 1,
                payload_ttl_secs: 1,
            },
        );
        let task = queued(&queue, &store, &agent, Priority::Normal).await;
        queue.dequeue(agent.id).await.unwrap().unwrap();
        assert_eq!(queue.purge_expired().await.unwrap(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(queue.purge_expired().await.unwrap(), 2);
        let residue = queue.residue(task.id).await.unwrap();
        assert!(!residue.locked);
        assert!(!residue.payload);
    }

    #[tokio::test]
    async fn test_purge_agent() {
        let (queue, store, agent) = setup().await;
        queued(&queue, &store, &agent, Priority::Normal).await;
        queued(&queue, &store, &agent, Priority::Low).await;
        queue.dequeue(agent.id).await.unwrap().unwrap();

        assert_eq!(queue.purge_agent(agent.id).await.unwrap(), 2);
        assert_eq!(queue.queue_depth(agent.id).await.unwrap().total, 0);
        assert!(queue.active_tasks(agent.id).await.unwrap().is_empty());
    }
}
