use crate::config::DirectoryConfig;
use chrono::Utc;
use relay_core::{
    Agent, AgentFilter, AgentStatistics, AgentStatus, AgentUpdate, Heartbeat, NewAgent,
    RelayError, RelayResult,
};
use relay_store::{AgentStore, DurableStore};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Registry of worker agents: registration, health tracking and capability lookup.
pub struct AgentDirectory {
    store: Arc<dyn DurableStore>,
    config: DirectoryConfig,
}

impl AgentDirectory {
    pub fn new(store: Arc<dyn DurableStore>, config: DirectoryConfig) -> Self {
        Self { store, config }
    }

    /// Register a new agent. Fails with `Conflict` if the name is taken.
    pub async fn register(&self, registration: NewAgent) -> RelayResult<Agent> {
        registration.validate()?;
        if self
            .store
            .get_agent_by_name(&registration.name)
            .await?
            .is_some()
        {
            return Err(RelayError::Conflict(format!(
                "agent '{}' already registered",
                registration.name
            )));
        }
        let agent = Agent::from_registration(registration);
        self.store.insert_agent(&agent).await?;
        info!(
            agent_id = %agent.id,
            name = %agent.name,
            version = %agent.version,
            supported_tasks = ?agent.capabilities.supported_tasks,
            "Agent registered"
        );
        Ok(agent)
    }

    /// Fetch an agent by id.
    pub async fn get(&self, id: Uuid) -> RelayResult<Agent> {
        self.store
            .get_agent(id)
            .await?
            .ok_or_else(|| RelayError::agent_not_found(id))
    }

    /// Fetch an agent by its unique name.
    pub async fn get_by_name(&self, name: &str) -> RelayResult<Agent> {
        self.store
            .get_agent_by_name(name)
            .await?
            .ok_or_else(|| RelayError::agent_not_found(name))
    }

    /// List agents, newest first.
    pub async fn list(&self, filter: &AgentFilter) -> RelayResult<Vec<Agent>> {
        self.store.list_agents(filter).await
    }

    /// Merge an operator update into the agent record.
    pub async fn update(&self, id: Uuid, update: AgentUpdate) -> RelayResult<Agent> {
        update.validate()?;
        let agent = self
            .store
            .modify_agent(
                id,
                Box::new(move |agent| {
                    update.apply_to(agent);
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| RelayError::agent_not_found(id))?;
        info!(agent_id = %id, status = %agent.status, "Agent updated");
        Ok(agent)
    }

    /// Remove the agent record; its tasks go with it.
    pub async fn delete(&self, id: Uuid) -> RelayResult<()> {
        if !self.store.delete_agent(id).await? {
            return Err(RelayError::agent_not_found(id));
        }
        info!(agent_id = %id, "Agent deleted");
        Ok(())
    }

    /// Record a heartbeat and apply the health thresholds.
    ///
    /// An active agent reporting health below `failed_below` becomes failed;
    /// a failed agent reporting health above `recover_above` becomes active.
    /// Paused and offline agents keep their administrative status.
    pub async fn heartbeat(&self, id: Uuid, heartbeat: Heartbeat) -> RelayResult<Agent> {
        let health = heartbeat.health_score;
        if !health.is_finite() || !(0.0..=1.0).contains(&health) {
            return Err(RelayError::InvalidInput(format!(
                "health_score must be within [0, 1], got {health}"
            )));
        }

        let failed_below = self.config.failed_below;
        let recover_above = self.config.recover_above;
        let now = Utc::now();
        let agent = self
            .store
            .modify_agent(
                id,
                Box::new(move |agent| {
                    agent.health_score = health;
                    agent.last_heartbeat = Some(now);
                    agent.last_metrics = heartbeat.metrics;
                    agent
                        .last_metrics
                        .insert("active_tasks".into(), heartbeat.active_tasks.into());
                    agent.status = next_status(agent.status, health, failed_below, recover_above);
                    agent.updated_at = now;
                    Ok(())
                }),
            )
            .await?
            .ok_or_else(|| RelayError::agent_not_found(id))?;

        match agent.status {
            AgentStatus::Failed if health < failed_below => {
                warn!(agent_id = %id, health_score = health, "Agent unhealthy");
            }
            AgentStatus::Active if health > recover_above => {
                info!(agent_id = %id, health_score = health, "Agent healthy");
            }
            _ => {}
        }
        Ok(agent)
    }

    /// Active agents that list `task_type`, healthiest first (ties by id).
    pub async fn find_capable(&self, task_type: &str) -> RelayResult<Vec<Agent>> {
        let filter = AgentFilter {
            status: Some(AgentStatus::Active),
            limit: usize::MAX,
            offset: 0,
        };
        let mut agents: Vec<Agent> = self
            .store
            .list_agents(&filter)
            .await?
            .into_iter()
            .filter(|a| a.can_handle(task_type))
            .collect();
        agents.sort_by(|a, b| {
            b.health_score
                .total_cmp(&a.health_score)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(agents)
    }

    /// Agent counts grouped by status.
    pub async fn statistics(&self) -> RelayResult<AgentStatistics> {
        let mut stats = AgentStatistics::default();
        for (status, count) in self.store.count_agents_by_status().await? {
            stats.add(status, count);
        }
        Ok(stats)
    }
}

fn next_status(
    current: AgentStatus,
    health: f64,
    failed_below: f64,
    recover_above: f64,
) -> AgentStatus {
    match current {
        AgentStatus::Active if health < failed_below => AgentStatus::Failed,
        AgentStatus::Failed if health > recover_above => AgentStatus::Active,
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relay_core::AgentCapabilities;
    use relay_store::SqliteStore;

    fn directory() -> AgentDirectory {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        AgentDirectory::new(store, DirectoryConfig::default())
    }

    fn registration(name: &str, tasks: &[&str]) -> NewAgent {
        NewAgent::new(name, "1.0.0", AgentCapabilities::new(tasks.iter().copied()))
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let dir = directory();
        let agent = dir
            .register(registration("patchbot", &["ci_failure_fix"]))
            .await
            .unwrap();
        assert_eq!(dir.get(agent.id).await.unwrap().name, "patchbot");
        assert_eq!(dir.get_by_name("patchbot").await.unwrap().id, agent.id);
        assert!(matches!(
            dir.get(Uuid::new_v4()).await.unwrap_err(),
            RelayError::NotFound { kind: "agent", .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let dir = directory();
        dir.register(registration("patchbot", &["ci_failure_fix"]))
            .await
            .unwrap();
        let err = dir
            .register(registration("patchbot", &["deploy"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let dir = directory();
        let mut reg = registration("patchbot", &["ci_failure_fix"]);
        reg.capabilities.max_concurrent_tasks = 0;
        assert!(matches!(
            dir.register(reg).await.unwrap_err(),
            RelayError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let dir = directory();
        let agent = dir
            .register(registration("patchbot", &["ci_failure_fix"]))
            .await
            .unwrap();
        let updated = dir
            .update(
                agent.id,
                AgentUpdate {
                    version: Some("1.1.0".into()),
                    status: Some(AgentStatus::Paused),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, "1.1.0");
        assert_eq!(updated.status, AgentStatus::Paused);
        assert_eq!(updated.capabilities, agent.capabilities);

        let err = dir
            .update(
                agent.id,
                AgentUpdate {
                    status: Some(AgentStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_thresholds() {
        let dir = directory();
        let agent = dir
            .register(registration("patchbot", &["ci_failure_fix"]))
            .await
            .unwrap();

        let sick = dir.heartbeat(agent.id, Heartbeat::new(0.2)).await.unwrap();
        assert_eq!(sick.status, AgentStatus::Failed);

        // Between the thresholds nothing changes.
        let middling = dir.heartbeat(agent.id, Heartbeat::new(0.5)).await.unwrap();
        assert_eq!(middling.status, AgentStatus::Failed);

        let well = dir.heartbeat(agent.id, Heartbeat::new(0.8)).await.unwrap();
        assert_eq!(well.status, AgentStatus::Active);
        assert_eq!(well.health_score, 0.8);
        assert_eq!(well.last_metrics["active_tasks"], 0);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_paused() {
        let dir = directory();
        let agent = dir
            .register(registration("patchbot", &["ci_failure_fix"]))
            .await
            .unwrap();
        dir.update(
            agent.id,
            AgentUpdate {
                status: Some(AgentStatus::Paused),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let paused = dir.heartbeat(agent.id, Heartbeat::new(0.1)).await.unwrap();
        assert_eq!(paused.status, AgentStatus::Paused);
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_out_of_range() {
        let dir = directory();
        let agent = dir
            .register(registration("patchbot", &["ci_failure_fix"]))
            .await
            .unwrap();
        let err = dir
            .heartbeat(agent.id, Heartbeat::new(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_find_capable_orders_by_health() {
        let dir = directory();
        let low = dir
            .register(registration("fixer-a", &["ci_failure_fix"]))
            .await
            .unwrap();
        let high = dir
            .register(registration("fixer-b", &["ci_failure_fix", "deploy"]))
            .await
            .unwrap();
        dir.register(registration("deployer", &["deploy"]))
            .await
            .unwrap();
        dir.heartbeat(low.id, Heartbeat::new(0.6)).await.unwrap();
        dir.heartbeat(high.id, Heartbeat::new(0.9)).await.unwrap();

        let capable = dir.find_capable("ci_failure_fix").await.unwrap();
        let ids: Vec<Uuid> = capable.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn test_statistics_and_delete() {
        let dir = directory();
        let a = dir
            .register(registration("fixer-a", &["ci_failure_fix"]))
            .await
            .unwrap();
        dir.register(registration("fixer-b", &["ci_failure_fix"]))
            .await
            .unwrap();
        dir.heartbeat(a.id, Heartbeat::new(0.1)).await.unwrap();

        let stats = dir.statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.failed, 1);

        dir.delete(a.id).await.unwrap();
        assert!(dir.delete(a.id).await.is_err());
        assert_eq!(dir.statistics().await.unwrap().total, 1);
    }
}
