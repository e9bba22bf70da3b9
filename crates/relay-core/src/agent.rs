use crate::error::{RelayError, RelayResult};
use crate::JsonMap;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

static VERSION_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$"));

/// Operational status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Eligible for new tasks.
    Active,
    /// Administratively paused.
    Paused,
    /// Unhealthy, set automatically from heartbeats.
    Failed,
    /// Not running.
    Offline,
}

impl AgentStatus {
    /// All statuses, in reporting order.
    pub const ALL: [AgentStatus; 4] = [
        AgentStatus::Active,
        AgentStatus::Paused,
        AgentStatus::Failed,
        AgentStatus::Offline,
    ];

    /// Stable string form used in storage and APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Failed => "failed",
            AgentStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "paused" => Ok(AgentStatus::Paused),
            "failed" => Ok(AgentStatus::Failed),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(RelayError::InvalidInput(format!(
                "unknown agent status '{other}'"
            ))),
        }
    }
}

/// What an agent can do and how much of it at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    /// Task types this agent accepts.
    pub supported_tasks: Vec<String>,
    /// Tasks the agent may have checked out at once.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
    /// Optional finer-grained sub-types (e.g. failure kinds for a fixer agent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_failure_types: Option<Vec<String>>,
    /// Default execution budget the agent advertises, in seconds.
    #[serde(default = "default_capability_timeout")]
    pub timeout_seconds: u32,
}

fn default_max_concurrent_tasks() -> u32 {
    5
}

fn default_capability_timeout() -> u32 {
    600
}

impl AgentCapabilities {
    /// Capabilities for the given task types with default limits.
    pub fn new<I, S>(supported_tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported_tasks: supported_tasks.into_iter().map(Into::into).collect(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            supported_failure_types: None,
            timeout_seconds: default_capability_timeout(),
        }
    }

    /// Override the concurrency limit.
    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Whether `task_type` is among the supported tasks.
    pub fn supports(&self, task_type: &str) -> bool {
        self.supported_tasks.iter().any(|t| t == task_type)
    }

    /// Check limits and shape.
    pub fn validate(&self) -> RelayResult<()> {
        if self.supported_tasks.is_empty() {
            return Err(RelayError::InvalidInput(
                "agent must support at least one task type".to_string(),
            ));
        }
        if !(1..=50).contains(&self.max_concurrent_tasks) {
            return Err(RelayError::InvalidInput(format!(
                "max_concurrent_tasks must be within 1..=50, got {}",
                self.max_concurrent_tasks
            )));
        }
        if !(60..=3600).contains(&self.timeout_seconds) {
            return Err(RelayError::InvalidInput(format!(
                "capability timeout_seconds must be within 60..=3600, got {}",
                self.timeout_seconds
            )));
        }
        Ok(())
    }
}

/// A registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub capabilities: AgentCapabilities,
    /// Opaque agent-specific settings.
    pub configuration: JsonMap,
    pub status: AgentStatus,
    /// Self-reported fitness in `[0, 1]`.
    pub health_score: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Metrics attached to the last heartbeat.
    #[serde(default)]
    pub last_metrics: JsonMap,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Build a fresh, active, fully healthy agent record from a registration.
    pub fn from_registration(registration: NewAgent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: registration.name,
            version: registration.version,
            description: registration.description,
            capabilities: registration.capabilities,
            configuration: registration.configuration,
            status: AgentStatus::Active,
            health_score: 1.0,
            last_heartbeat: Some(now),
            last_metrics: JsonMap::new(),
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the agent is active and lists `task_type` among its capabilities.
    pub fn can_handle(&self, task_type: &str) -> bool {
        self.status == AgentStatus::Active && self.capabilities.supports(task_type)
    }

    /// Fraction of finished tasks that succeeded, `None` before the first one.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_tasks == 0 {
            None
        } else {
            Some(self.successful_tasks as f64 / self.total_tasks as f64)
        }
    }
}

/// Registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub capabilities: AgentCapabilities,
    #[serde(default)]
    pub configuration: JsonMap,
}

impl NewAgent {
    /// Registration with no description or configuration.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        capabilities: AgentCapabilities,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            capabilities,
            configuration: JsonMap::new(),
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check name, version and capabilities.
    pub fn validate(&self) -> RelayResult<()> {
        let name_len = self.name.chars().count();
        if !(3..=100).contains(&name_len) {
            return Err(RelayError::InvalidInput(format!(
                "agent name must be 3-100 characters, got {name_len}"
            )));
        }
        validate_version(&self.version)?;
        if let Some(description) = &self.description {
            if description.chars().count() > 500 {
                return Err(RelayError::InvalidInput(
                    "agent description must be at most 500 characters".to_string(),
                ));
            }
        }
        self.capabilities.validate()
    }
}

/// Partial update applied by operators. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub version: Option<String>,
    pub description: Option<String>,
    pub capabilities: Option<AgentCapabilities>,
    pub configuration: Option<JsonMap>,
    pub status: Option<AgentStatus>,
}

impl AgentUpdate {
    /// Check every field that is present.
    pub fn validate(&self) -> RelayResult<()> {
        if let Some(version) = &self.version {
            validate_version(version)?;
        }
        if let Some(capabilities) = &self.capabilities {
            capabilities.validate()?;
        }
        if self.status == Some(AgentStatus::Failed) {
            return Err(RelayError::InvalidInput(
                "status 'failed' is set from heartbeats only".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge the present fields into `agent`.
    pub fn apply_to(self, agent: &mut Agent) {
        if let Some(version) = self.version {
            agent.version = version;
        }
        if let Some(description) = self.description {
            agent.description = Some(description);
        }
        if let Some(capabilities) = self.capabilities {
            agent.capabilities = capabilities;
        }
        if let Some(configuration) = self.configuration {
            agent.configuration = configuration;
        }
        if let Some(status) = self.status {
            agent.status = status;
        }
        agent.updated_at = Utc::now();
    }
}

/// Periodic liveness report from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub health_score: f64,
    /// Number of tasks the agent believes it is executing.
    #[serde(default)]
    pub active_tasks: u32,
    #[serde(default)]
    pub metrics: JsonMap,
}

impl Heartbeat {
    /// Heartbeat carrying only a health score.
    pub fn new(health_score: f64) -> Self {
        Self {
            health_score,
            active_tasks: 0,
            metrics: JsonMap::new(),
        }
    }
}

/// Listing filter for agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for AgentFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}

/// Agent counts grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatistics {
    pub total: u64,
    pub active: u64,
    pub paused: u64,
    pub failed: u64,
    pub offline: u64,
}

impl AgentStatistics {
    /// Add `count` agents with `status`.
    pub fn add(&mut self, status: AgentStatus, count: u64) {
        self.total += count;
        match status {
            AgentStatus::Active => self.active += count,
            AgentStatus::Paused => self.paused += count,
            AgentStatus::Failed => self.failed += count,
            AgentStatus::Offline => self.offline += count,
        }
    }
}

fn validate_version(version: &str) -> RelayResult<()> {
    let pattern = VERSION_PATTERN
        .as_ref()
        .map_err(|e| RelayError::Config(format!("version pattern failed to compile: {e}")))?;
    if pattern.is_match(version) {
        Ok(())
    } else {
        Err(RelayError::InvalidInput(format!(
            "version '{version}' is not MAJOR.MINOR.PATCH"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registration() -> NewAgent {
        NewAgent::new("patchbot", "1.2.0", AgentCapabilities::new(["ci_failure_fix"]))
    }

    #[test]
    fn test_registration_defaults() {
        let agent = Agent::from_registration(registration());
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.health_score, 1.0);
        assert_eq!(agent.capabilities.max_concurrent_tasks, 5);
        assert!(agent.last_heartbeat.is_some());
        assert!(agent.success_rate().is_none());
    }

    #[test]
    fn test_can_handle_requires_active() {
        let mut agent = Agent::from_registration(registration());
        assert!(agent.can_handle("ci_failure_fix"));
        assert!(!agent.can_handle("deploy"));
        agent.status = AgentStatus::Paused;
        assert!(!agent.can_handle("ci_failure_fix"));
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut reg = registration();
        reg.version = "v1".into();
        assert!(matches!(reg.validate(), Err(RelayError::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_short_name() {
        let mut reg = registration();
        reg.name = "pb".into();
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_capability_limits() {
        let caps = AgentCapabilities::new(["a_task"]).with_max_concurrent(0);
        assert!(caps.validate().is_err());
        let caps = AgentCapabilities::new(Vec::<String>::new());
        assert!(caps.validate().is_err());
        assert!(AgentCapabilities::new(["a_task"]).validate().is_ok());
    }

    #[test]
    fn test_update_cannot_set_failed() {
        let update = AgentUpdate {
            status: Some(AgentStatus::Failed),
            ..Default::default()
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn test_update_merges_present_fields() {
        let mut agent = Agent::from_registration(registration());
        AgentUpdate {
            version: Some("2.0.0".into()),
            status: Some(AgentStatus::Paused),
            ..Default::default()
        }
        .apply_to(&mut agent);
        assert_eq!(agent.version, "2.0.0");
        assert_eq!(agent.status, AgentStatus::Paused);
        assert_eq!(agent.name, "patchbot");
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in AgentStatus::ALL {
            assert_eq!(status.as_str().parse::<AgentStatus>().unwrap(), status);
        }
        assert!("sleeping".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn test_capabilities_deserialize_with_defaults() {
        let caps: AgentCapabilities =
            serde_json::from_str(r#"{"supported_tasks":["ci_failure_fix"]}"#).unwrap();
        assert_eq!(caps.max_concurrent_tasks, 5);
        assert_eq!(caps.timeout_seconds, 600);
    }
}
