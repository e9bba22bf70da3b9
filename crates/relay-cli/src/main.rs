use clap::{Parser, Subcommand};
use relay_core::{AgentCapabilities, AgentFilter, AgentStatus, NewAgent, TaskFilter, TaskStatus};
use relay_orchestrator::{MemoryEphemeralStore, RelayConfig, TaskManager, TimeoutSweeper};
use relay_store::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "relay", about = "Relay: task distribution for autonomous agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rehydrate the queue and run the timeout sweeper until Ctrl-C
    Serve,
    /// List registered agents
    Agents {
        #[arg(long)]
        status: Option<AgentStatus>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Register a new agent
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        /// Supported task type (repeatable)
        #[arg(long = "task-type", required = true)]
        task_types: Vec<String>,
        #[arg(long)]
        max_concurrent: Option<u32>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List tasks, newest first
    Tasks {
        #[arg(long)]
        agent: Option<Uuid>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        task_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Print task and agent statistics as JSON
    Stats {
        #[arg(long)]
        agent: Option<Uuid>,
    },
}

fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    if path.exists() {
        return RelayConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {e}", path.display()));
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    Ok(RelayConfig::default())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let store = Arc::new(SqliteStore::open(&config.store.database_path)?);
    let manager = Arc::new(TaskManager::new(
        store,
        Box::new(MemoryEphemeralStore::new()),
        &config,
    ));

    match cli.command {
        Commands::Serve => {
            let report = manager.queue().rehydrate().await?;
            info!(
                database = %config.store.database_path.display(),
                requeued = report.requeued,
                running = report.restored_running,
                "Relay started"
            );

            let sweeper =
                TimeoutSweeper::new(Arc::clone(&manager), config.tasks.sweep_interval()).start();
            let mut summary = tokio::time::interval(config.tasks.sweep_interval());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = summary.tick() => {
                        match manager.get_task_statistics(None).await {
                            Ok(stats) => info!(
                                queued = stats.queued,
                                running = stats.running,
                                completed = stats.completed,
                                failed = stats.failed,
                                "Task summary"
                            ),
                            Err(e) => warn!(error = %e, "Could not compute task summary"),
                        }
                    }
                }
            }
            sweeper.abort();
            info!("Relay stopped");
        }
        Commands::Agents {
            status,
            limit,
            offset,
        } => {
            let agents = manager
                .directory()
                .list(&AgentFilter {
                    status,
                    limit,
                    offset,
                })
                .await?;
            if agents.is_empty() {
                println!("No agents registered.");
            }
            for agent in &agents {
                println!(
                    "{}  {:<24} {:<8} health={:.2} tasks={} ({})",
                    agent.id,
                    agent.name,
                    agent.status,
                    agent.health_score,
                    agent.total_tasks,
                    agent.capabilities.supported_tasks.join(","),
                );
            }
        }
        Commands::Register {
            name,
            version,
            task_types,
            max_concurrent,
            description,
        } => {
            let capabilities = AgentCapabilities::new(task_types).with_max_concurrent(
                max_concurrent.unwrap_or(config.directory.default_max_concurrent_tasks),
            );
            let mut registration = NewAgent::new(name, version, capabilities);
            registration.description = description;
            let agent = manager.directory().register(registration).await?;
            println!("{}", serde_json::to_string_pretty(&agent)?);
        }
        Commands::Tasks {
            agent,
            status,
            task_type,
            limit,
            offset,
        } => {
            let tasks = manager
                .list_tasks(&TaskFilter {
                    agent_id: agent,
                    status,
                    task_type,
                    correlation_id: None,
                    limit: Some(limit),
                    offset,
                })
                .await?;
            if tasks.is_empty() {
                println!("No tasks found.");
            }
            for task in &tasks {
                println!(
                    "{}  {:<20} {:<12} agent={} retries={}/{} progress={:.0}%",
                    task.id,
                    task.task_type,
                    task.status,
                    task.agent_id,
                    task.retry_count,
                    task.max_retries,
                    task.progress * 100.0,
                );
            }
        }
        Commands::Stats { agent } => {
            let tasks = manager.get_task_statistics(agent).await?;
            let body = match agent {
                Some(agent_id) => {
                    let queue = manager.get_agent_queue_status(agent_id).await?;
                    serde_json::json!({ "tasks": tasks, "agent": queue })
                }
                None => {
                    let agents = manager.directory().statistics().await?;
                    serde_json::json!({ "tasks": tasks, "agents": agents })
                }
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}
