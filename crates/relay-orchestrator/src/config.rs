use relay_core::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration, usually read from `relay.toml`.
///
/// Every section and field is optional; missing values fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Durable store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Ephemeral queue/lock store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Expiry of the per-task dequeue lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Expiry of the ephemeral payload record.
    #[serde(default = "default_payload_ttl")]
    pub payload_ttl_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            payload_ttl_secs: default_payload_ttl(),
        }
    }
}

impl QueueConfig {
    /// Lock expiry as a [`Duration`].
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Payload expiry as a [`Duration`].
    pub fn payload_ttl(&self) -> Duration {
        Duration::from_secs(self.payload_ttl_secs)
    }
}

/// Task defaults and the timeout sweep interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u32,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            default_max_retries: default_max_retries(),
            max_timeout_secs: default_max_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl TaskConfig {
    /// Timeout sweep period as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Health thresholds driving automatic agent status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Heartbeat health strictly below this marks the agent failed.
    #[serde(default = "default_failed_below")]
    pub failed_below: f64,
    /// A failed agent reporting health strictly above this becomes active again.
    #[serde(default = "default_recover_above")]
    pub recover_above: f64,
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent_tasks: u32,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            failed_below: default_failed_below(),
            recover_above: default_recover_above(),
            default_max_concurrent_tasks: default_max_concurrent(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/relay.db")
}
fn default_lock_ttl() -> u64 {
    300
}
fn default_payload_ttl() -> u64 {
    86_400
}
fn default_timeout() -> u32 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_timeout() -> u32 {
    3600
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_failed_below() -> f64 {
    0.3
}
fn default_recover_above() -> f64 {
    0.7
}
fn default_max_concurrent() -> u32 {
    5
}

impl RelayConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(raw: &str) -> RelayResult<Self> {
        let config: RelayConfig =
            toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the queue and directory cannot work with.
    pub fn validate(&self) -> RelayResult<()> {
        if self.queue.lock_ttl_secs == 0 || self.queue.payload_ttl_secs == 0 {
            return Err(RelayError::Config(
                "queue TTLs must be greater than zero".to_string(),
            ));
        }
        if self.tasks.sweep_interval_secs == 0 {
            return Err(RelayError::Config(
                "tasks.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.tasks.max_timeout_secs == 0
            || self.tasks.default_timeout_secs == 0
            || self.tasks.default_timeout_secs > self.tasks.max_timeout_secs
        {
            return Err(RelayError::Config(format!(
                "tasks.default_timeout_secs must be within 1..={}",
                self.tasks.max_timeout_secs
            )));
        }
        let d = &self.directory;
        if !(0.0..=1.0).contains(&d.failed_below) || !(0.0..=1.0).contains(&d.recover_above) {
            return Err(RelayError::Config(
                "directory health thresholds must be within [0, 1]".to_string(),
            ));
        }
        if d.failed_below >= d.recover_above {
            return Err(RelayError::Config(format!(
                "directory.failed_below ({}) must be lower than recover_above ({})",
                d.failed_below, d.recover_above
            )));
        }
        if !(1..=50).contains(&d.default_max_concurrent_tasks) {
            return Err(RelayError::Config(
                "directory.default_max_concurrent_tasks must be within 1..=50".to_string(),
            ));
        }
        Ok(())
    }
}
