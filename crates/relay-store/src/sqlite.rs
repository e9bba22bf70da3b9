use crate::migrations::{migrations, Migration, MIGRATIONS_TABLE};
use crate::store::{AgentMutation, AgentStore, TaskMutation, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{
    Agent, AgentFilter, AgentStatus, RelayError, RelayResult, StatusSummary, Task, TaskFilter,
    TaskStatus,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, ToSql};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

const AGENT_COLUMNS: &str = "id, name, version, description, capabilities, configuration, \
     status, health_score, last_heartbeat, last_metrics, total_tasks, successful_tasks, \
     failed_tasks, created_at, updated_at";

const TASK_COLUMNS: &str = "id, agent_id, task_type, context, payload, status, progress, \
     result, artifacts, metrics, error_message, started_at, completed_at, duration_ms, \
     timeout_seconds, retry_count, max_retries, correlation_id, created_at, updated_at";

/// SQLite-backed durable store.
///
/// One connection guarded by a mutex; every trait call is a short critical
/// section, and read-modify-write calls run inside a transaction.
pub struct SqliteStore {
    connection: Mutex<Connection>,
    database_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if needed) a database file and migrate it to the latest schema.
    pub fn open(database_path: impl Into<PathBuf>) -> RelayResult<Self> {
        let database_path = database_path.into();
        if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(&database_path).map_err(sql_error("open"))?;
        connection
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .map_err(sql_error("open"))?;
        let store = Self::from_connection(connection, Some(database_path))?;
        info!(path = ?store.database_path, "Durable store opened");
        Ok(store)
    }

    /// A private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> RelayResult<Self> {
        let connection = Connection::open_in_memory().map_err(sql_error("open"))?;
        Self::from_connection(connection, None)
    }

    fn from_connection(connection: Connection, database_path: Option<PathBuf>) -> RelayResult<Self> {
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(sql_error("open"))?;
        let store = Self {
            connection: Mutex::new(connection),
            database_path,
        };
        store.migrate_to_latest()?;
        Ok(store)
    }

    /// Path of the backing file, `None` for in-memory stores.
    pub fn database_path(&self) -> Option<&Path> {
        self.database_path.as_deref()
    }

    /// Highest applied schema version.
    pub fn schema_version(&self) -> RelayResult<i64> {
        self.with_connection("schema_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn migrate_to_latest(&self) -> RelayResult<()> {
        self.with_connection("migrate", |connection| {
            ensure_migrations_table(connection)?;
            let current = read_current_version(connection)?;
            for migration in migrations().iter().filter(|m| m.version > current) {
                apply_migration(connection, migration)?;
                debug!(version = migration.version, name = migration.name, "Applied migration");
            }
            Ok(())
        })
        .map_err(|e| match e {
            RelayError::StoreUnavailable { reason, .. } => {
                RelayError::durable(format!("migration failed: {reason}"))
            }
            other => other,
        })
    }

    fn with_connection<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> RelayResult<T> {
        let mut connection = self.connection.lock();
        f(&mut connection).map_err(sql_error(operation))
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn insert_agent(&self, agent: &Agent) -> RelayResult<()> {
        let capabilities = to_json(&agent.capabilities)?;
        let configuration = to_json(&agent.configuration)?;
        let last_metrics = to_json(&agent.last_metrics)?;
        let connection = self.connection.lock();
        let result = connection.execute(
            &format!(
                "INSERT INTO agents ({AGENT_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                agent.id.to_string(),
                agent.name,
                agent.version,
                agent.description,
                capabilities,
                configuration,
                agent.status.as_str(),
                agent.health_score,
                agent.last_heartbeat,
                last_metrics,
                agent.total_tasks,
                agent.successful_tasks,
                agent.failed_tasks,
                agent.created_at,
                agent.updated_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint(&e) => Err(RelayError::Conflict(format!(
                "agent '{}' already registered",
                agent.name
            ))),
            Err(e) => Err(sql_error("insert_agent")(e)),
        }
    }

    async fn get_agent(&self, id: Uuid) -> RelayResult<Option<Agent>> {
        self.with_connection("get_agent", |connection| {
            connection
                .query_row(
                    &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                    [id.to_string()],
                    agent_from_row,
                )
                .optional()
        })
    }

    async fn get_agent_by_name(&self, name: &str) -> RelayResult<Option<Agent>> {
        self.with_connection("get_agent_by_name", |connection| {
            connection
                .query_row(
                    &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"),
                    [name],
                    agent_from_row,
                )
                .optional()
        })
    }

    async fn modify_agent(
        &self,
        id: Uuid,
        mutation: AgentMutation,
    ) -> RelayResult<Option<Agent>> {
        let mut connection = self.connection.lock();
        let transaction = connection.transaction().map_err(sql_error("modify_agent"))?;
        let current = transaction
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                [id.to_string()],
                agent_from_row,
            )
            .optional()
            .map_err(sql_error("modify_agent"))?;
        let Some(mut agent) = current else {
            return Ok(None);
        };
        mutation(&mut agent)?;
        transaction
            .execute(
                "UPDATE agents SET version = ?2, description = ?3, capabilities = ?4, \
                 configuration = ?5, status = ?6, health_score = ?7, last_heartbeat = ?8, \
                 last_metrics = ?9, total_tasks = ?10, successful_tasks = ?11, \
                 failed_tasks = ?12, updated_at = ?13 WHERE id = ?1",
                params![
                    agent.id.to_string(),
                    agent.version,
                    agent.description,
                    to_json(&agent.capabilities)?,
                    to_json(&agent.configuration)?,
                    agent.status.as_str(),
                    agent.health_score,
                    agent.last_heartbeat,
                    to_json(&agent.last_metrics)?,
                    agent.total_tasks,
                    agent.successful_tasks,
                    agent.failed_tasks,
                    agent.updated_at,
                ],
            )
            .map_err(sql_error("modify_agent"))?;
        transaction.commit().map_err(sql_error("modify_agent"))?;
        Ok(Some(agent))
    }

    async fn delete_agent(&self, id: Uuid) -> RelayResult<bool> {
        self.with_connection("delete_agent", |connection| {
            let removed = connection.execute("DELETE FROM agents WHERE id = ?1", [id.to_string()])?;
            Ok(removed > 0)
        })
    }

    async fn list_agents(&self, filter: &AgentFilter) -> RelayResult<Vec<Agent>> {
        self.with_connection("list_agents", |connection| {
            let mut sql = format!("SELECT {AGENT_COLUMNS} FROM agents");
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(status) = filter.status {
                sql.push_str(" WHERE status = ?");
                values.push(Box::new(status.as_str()));
            }
            sql.push_str(" ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
            values.push(Box::new(clamp_i64(filter.limit)));
            values.push(Box::new(clamp_i64(filter.offset)));

            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(values.iter()), agent_from_row)?;
            rows.collect()
        })
    }

    async fn count_agents_by_status(&self) -> RelayResult<Vec<(AgentStatus, u64)>> {
        self.with_connection("count_agents_by_status", |connection| {
            let mut statement =
                connection.prepare("SELECT status, COUNT(*) FROM agents GROUP BY status")?;
            let rows = statement.query_map([], |row| {
                Ok((parse_column::<AgentStatus>(row, 0)?, row.get::<_, u64>(1)?))
            })?;
            rows.collect()
        })
    }

    async fn record_task_outcome(&self, agent_id: Uuid, success: bool) -> RelayResult<()> {
        let (succeeded, failed) = if success { (1, 0) } else { (0, 1) };
        let updated = self.with_connection("record_task_outcome", |connection| {
            connection.execute(
                "UPDATE agents SET total_tasks = total_tasks + 1, \
                 successful_tasks = successful_tasks + ?2, failed_tasks = failed_tasks + ?3, \
                 updated_at = ?4 WHERE id = ?1",
                params![agent_id.to_string(), succeeded, failed, Utc::now()],
            )
        })?;
        if updated == 0 {
            return Err(RelayError::agent_not_found(agent_id));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> RelayResult<()> {
        let context = to_json(&task.context)?;
        let result = optional_json(task.result.as_ref())?;
        let artifacts = to_json(&task.artifacts)?;
        let metrics = to_json(&task.metrics)?;
        let outcome = self.with_connection("insert_task", |connection| {
            connection.execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, \
                     ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    task.id.to_string(),
                    task.agent_id.to_string(),
                    task.task_type,
                    context,
                    task.payload,
                    task.status.as_str(),
                    task.progress,
                    result,
                    artifacts,
                    metrics,
                    task.error_message,
                    task.started_at,
                    task.completed_at,
                    task.duration_ms,
                    task.timeout_seconds,
                    task.retry_count,
                    task.max_retries,
                    task.correlation_id.map(|id| id.to_string()),
                    task.created_at,
                    task.updated_at,
                ],
            )
        });
        match outcome {
            Ok(_) => Ok(()),
            Err(RelayError::StoreUnavailable { reason, .. })
                if reason.contains("FOREIGN KEY constraint failed") =>
            {
                Err(RelayError::agent_not_found(task.agent_id))
            }
            Err(RelayError::StoreUnavailable { reason, .. })
                if reason.contains("UNIQUE constraint failed") =>
            {
                Err(RelayError::Conflict(format!("task {} already exists", task.id)))
            }
            Err(other) => Err(other),
        }
    }

    async fn get_task(&self, id: Uuid) -> RelayResult<Option<Task>> {
        self.with_connection("get_task", |connection| {
            connection
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    [id.to_string()],
                    task_from_row,
                )
                .optional()
        })
    }

    async fn modify_task(&self, id: Uuid, mutation: TaskMutation) -> RelayResult<Option<Task>> {
        let mut connection = self.connection.lock();
        let transaction = connection.transaction().map_err(sql_error("modify_task"))?;
        let current = transaction
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id.to_string()],
                task_from_row,
            )
            .optional()
            .map_err(sql_error("modify_task"))?;
        let Some(mut task) = current else {
            return Ok(None);
        };
        mutation(&mut task)?;
        let written = transaction.execute(
            "UPDATE tasks SET agent_id = ?2, context = ?3, payload = ?4, status = ?5, \
             progress = ?6, result = ?7, artifacts = ?8, metrics = ?9, error_message = ?10, \
             started_at = ?11, completed_at = ?12, duration_ms = ?13, timeout_seconds = ?14, \
             retry_count = ?15, max_retries = ?16, correlation_id = ?17, updated_at = ?18 \
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.agent_id.to_string(),
                to_json(&task.context)?,
                task.payload,
                task.status.as_str(),
                task.progress,
                optional_json(task.result.as_ref())?,
                to_json(&task.artifacts)?,
                to_json(&task.metrics)?,
                task.error_message,
                task.started_at,
                task.completed_at,
                task.duration_ms,
                task.timeout_seconds,
                task.retry_count,
                task.max_retries,
                task.correlation_id.map(|id| id.to_string()),
                task.updated_at,
            ],
        );
        match written {
            Err(e) if is_constraint(&e) => return Err(RelayError::agent_not_found(task.agent_id)),
            other => {
                other.map_err(sql_error("modify_task"))?;
            }
        }
        transaction.commit().map_err(sql_error("modify_task"))?;
        Ok(Some(task))
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> RelayResult<Vec<Task>> {
        self.with_connection("list_tasks", |connection| {
            let mut conditions: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();
            if let Some(agent_id) = filter.agent_id {
                conditions.push("agent_id = ?");
                values.push(Box::new(agent_id.to_string()));
            }
            if let Some(status) = filter.status {
                conditions.push("status = ?");
                values.push(Box::new(status.as_str()));
            }
            if let Some(task_type) = &filter.task_type {
                conditions.push("task_type = ?");
                values.push(Box::new(task_type.clone()));
            }
            if let Some(correlation_id) = filter.correlation_id {
                conditions.push("correlation_id = ?");
                values.push(Box::new(correlation_id.to_string()));
            }

            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
            if !conditions.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
            }
            sql.push_str(" ORDER BY created_at DESC, id LIMIT ? OFFSET ?");
            values.push(Box::new(filter.limit.map_or(-1, clamp_i64)));
            values.push(Box::new(clamp_i64(filter.offset)));

            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params_from_iter(values.iter()), task_from_row)?;
            rows.collect()
        })
    }

    async fn summarize_tasks(&self, agent_id: Option<Uuid>) -> RelayResult<Vec<StatusSummary>> {
        self.with_connection("summarize_tasks", |connection| {
            match agent_id {
                Some(agent_id) => {
                    let mut statement = connection.prepare(
                        "SELECT status, COUNT(*), AVG(duration_ms) FROM tasks \
                         WHERE agent_id = ?1 GROUP BY status",
                    )?;
                    let rows = statement.query_map([agent_id.to_string()], summary_from_row)?;
                    rows.collect()
                }
                None => {
                    let mut statement = connection.prepare(
                        "SELECT status, COUNT(*), AVG(duration_ms) FROM tasks GROUP BY status",
                    )?;
                    let rows = statement.query_map([], summary_from_row)?;
                    rows.collect()
                }
            }
        })
    }
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );"
    ))
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_migration(connection: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    // ALTER TABLE ADD COLUMN is not idempotent in SQLite.
    match transaction.execute_batch(migration.up_sql) {
        Err(e) if e.to_string().contains("duplicate column name") => {}
        other => other?,
    }
    transaction.execute(
        &format!("INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at) VALUES (?1, ?2, ?3)"),
        params![migration.version, migration.name, Utc::now()],
    )?;
    transaction.commit()
}

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        capabilities: json_column(row, 4)?,
        configuration: json_column(row, 5)?,
        status: parse_column(row, 6)?,
        health_score: row.get(7)?,
        last_heartbeat: row.get::<_, Option<DateTime<Utc>>>(8)?,
        last_metrics: json_column(row, 9)?,
        total_tasks: row.get(10)?,
        successful_tasks: row.get(11)?,
        failed_tasks: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let result: Option<String> = row.get(7)?;
    let result = result
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    let correlation_id: Option<String> = row.get(17)?;
    let correlation_id = correlation_id
        .map(|raw| Uuid::parse_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(17, Type::Text, Box::new(e)))?;

    Ok(Task {
        id: uuid_column(row, 0)?,
        agent_id: uuid_column(row, 1)?,
        task_type: row.get(2)?,
        context: json_column(row, 3)?,
        payload: row.get(4)?,
        status: parse_column(row, 5)?,
        progress: row.get(6)?,
        result,
        artifacts: json_column(row, 8)?,
        metrics: json_column(row, 9)?,
        error_message: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        duration_ms: row.get(13)?,
        timeout_seconds: row.get(14)?,
        retry_count: row.get(15)?,
        max_retries: row.get(16)?,
        correlation_id,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<StatusSummary> {
    Ok(StatusSummary {
        status: parse_column::<TaskStatus>(row, 0)?,
        count: row.get(1)?,
        avg_duration_ms: row.get(2)?,
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = RelayError>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> RelayResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn optional_json(value: Option<&serde_json::Value>) -> RelayResult<Option<String>> {
    value.map(to_json).transpose()
}

fn clamp_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_constraint(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn sql_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> RelayError {
    move |error| RelayError::durable(format!("sqlite '{operation}' failed: {error}"))
}
