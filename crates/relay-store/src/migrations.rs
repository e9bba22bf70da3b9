/// One versioned schema step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Migration {
    /// Strictly increasing version number.
    pub version: i64,
    /// Short identifier recorded in the migrations table.
    pub name: &'static str,
    /// Idempotent DDL applied when upgrading to this version.
    pub up_sql: &'static str,
}

/// Table recording applied schema versions.
pub const MIGRATIONS_TABLE: &str = "relay_schema_migrations";

const MIGRATION_0001: Migration = Migration {
    version: 1,
    name: "agents_and_tasks",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL,
    description TEXT,
    capabilities TEXT NOT NULL,
    configuration TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'active',
    health_score REAL NOT NULL DEFAULT 1.0,
    last_heartbeat TEXT,
    total_tasks INTEGER NOT NULL DEFAULT 0,
    successful_tasks INTEGER NOT NULL DEFAULT 0,
    failed_tasks INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_status ON agents (status);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL REFERENCES agents (id) ON DELETE CASCADE,
    task_type TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '{}',
    payload TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    progress REAL NOT NULL DEFAULT 0.0,
    result TEXT,
    artifacts TEXT NOT NULL DEFAULT '[]',
    metrics TEXT NOT NULL DEFAULT '{}',
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    duration_ms INTEGER,
    timeout_seconds INTEGER NOT NULL DEFAULT 600,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    correlation_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks (agent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks (task_type);
CREATE INDEX IF NOT EXISTS idx_tasks_correlation ON tasks (correlation_id);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks (created_at DESC);
"#,
};

const MIGRATION_0002: Migration = Migration {
    version: 2,
    name: "agent_heartbeat_metrics",
    up_sql: r#"
ALTER TABLE agents ADD COLUMN last_metrics TEXT NOT NULL DEFAULT '{}';
"#,
};

const MIGRATIONS: [Migration; 2] = [MIGRATION_0001, MIGRATION_0002];

/// Every migration in version order.
pub fn migrations() -> &'static [Migration] {
    &MIGRATIONS
}

/// Latest schema version this build knows about.
pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_strictly_increase() {
        let mut previous = 0;
        for m in migrations() {
            assert!(m.version > previous);
            assert!(!m.up_sql.trim().is_empty());
            previous = m.version;
        }
        assert_eq!(current_schema_version(), previous);
    }
}
