use crate::error::{RelayError, RelayResult};
use crate::JsonMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// ```text
/// pending -> queued -> running -> completed
///                          \----> failed -> queued (while retry budget remains)
/// pending | queued | running -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    RateLimited,
}

impl TaskStatus {
    /// All statuses, in reporting order.
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::RateLimited,
    ];

    /// Stable string form used in storage and APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::RateLimited => "rate_limited",
        }
    }

    /// Whether an operator may still cancel a task in this status.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running | TaskStatus::RateLimited
        )
    }

    /// Completed, failed or cancelled.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RelayError::InvalidInput(format!("unknown task status '{s}'")))
    }
}

/// Queue tier. Higher tiers drain first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Drain order: high, normal, low.
    pub const DRAIN_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(RelayError::InvalidInput(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// A unit of work owned by one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Owning agent; changes on reassignment.
    pub agent_id: Uuid,
    pub task_type: String,
    /// Opaque parameters handed to the agent.
    pub context: JsonMap,
    /// Optional large payload kept out of the queue.
    pub payload: Option<String>,
    pub status: TaskStatus,
    /// Progress in `[0, 1]`.
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
    #[serde(default)]
    pub metrics: JsonMap,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub timeout_seconds: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Links the task to an external originating decision.
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A pending task for `agent_id`.
    pub fn new(
        agent_id: Uuid,
        task_type: impl Into<String>,
        context: JsonMap,
        timeout_seconds: u32,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_type: task_type.into(),
            context,
            payload: None,
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            artifacts: Vec::new(),
            metrics: JsonMap::new(),
            error_message: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            timeout_seconds,
            retry_count: 0,
            max_retries,
            correlation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether another retry fits in the budget.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Deadline of a running task, `None` if it never started.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.started_at
            .map(|started| started + chrono::Duration::seconds(i64::from(self.timeout_seconds)))
    }

    /// Whether a running task has exceeded its budget at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.deadline().is_some_and(|d| d <= now)
    }

    /// Transition to `running`; `started_at` is only set on the first transition.
    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Transition to `completed` or `failed`, stamping completion time and duration.
    pub fn mark_finished(&mut self, success: bool, now: DateTime<Utc>) {
        self.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds());
        self.updated_at = now;
    }
}

/// Creation request from a producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub context: JsonMap,
    #[serde(default)]
    pub payload: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u32>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Priority,
}

impl NewTask {
    /// Request with default priority and no optional fields.
    pub fn new(task_type: impl Into<String>, context: JsonMap) -> Self {
        Self {
            task_type: task_type.into(),
            context,
            ..Default::default()
        }
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the execution budget.
    pub fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Link to an originating decision.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Attach a large payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Check the task type and timeout against `max_timeout_secs`.
    pub fn validate(&self, max_timeout_secs: u32) -> RelayResult<()> {
        let len = self.task_type.chars().count();
        if !(3..=50).contains(&len) {
            return Err(RelayError::InvalidInput(format!(
                "task_type must be 3-50 characters, got {len}"
            )));
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 || timeout > max_timeout_secs {
                return Err(RelayError::InvalidInput(format!(
                    "timeout_seconds must be within 1..={max_timeout_secs}, got {timeout}"
                )));
            }
        }
        Ok(())
    }
}

/// Completion report from an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
    #[serde(default)]
    pub metrics: Option<JsonMap>,
}

impl TaskOutcome {
    /// A successful outcome with an optional result.
    pub fn success(result: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            result,
            ..Default::default()
        }
    }

    /// A failed outcome with an error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Listing filter for tasks. Results are newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFilter {
    pub agent_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub correlation_id: Option<Uuid>,
    /// `None` returns every match.
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            agent_id: None,
            status: None,
            task_type: None,
            correlation_id: None,
            limit: Some(100),
            offset: 0,
        }
    }
}

impl TaskFilter {
    /// Every task with `status`, unbounded.
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
            ..Default::default()
        }
    }
}

/// One row of the per-status aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: TaskStatus,
    pub count: u64,
    pub avg_duration_ms: Option<f64>,
}

/// Aggregate task view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: u64,
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rate_limited: u64,
    /// Mean duration of completed tasks.
    pub avg_duration_ms: Option<f64>,
    /// `completed / (completed + failed)`, 0 when nothing finished.
    pub success_rate: f64,
}

impl TaskStatistics {
    /// Fold per-status rows into the aggregate.
    pub fn from_summaries(rows: &[StatusSummary]) -> Self {
        let mut stats = TaskStatistics::default();
        for row in rows {
            stats.total += row.count;
            match row.status {
                TaskStatus::Pending => stats.pending += row.count,
                TaskStatus::Queued => stats.queued += row.count,
                TaskStatus::Running => stats.running += row.count,
                TaskStatus::Completed => {
                    stats.completed += row.count;
                    stats.avg_duration_ms = row.avg_duration_ms;
                }
                TaskStatus::Failed => stats.failed += row.count,
                TaskStatus::Cancelled => stats.cancelled += row.count,
                TaskStatus::RateLimited => stats.rate_limited += row.count,
            }
        }
        let finished = stats.completed + stats.failed;
        stats.success_rate = if finished > 0 {
            stats.completed as f64 / finished as f64
        } else {
            0.0
        };
        stats
    }
}
