//! Configuration management
//!
//! One [`Config`] is built at process start (usually via [`Config::from_env`])
//! and handed to the components that need it. Nothing here is global.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Could not parse {key}={value}")]
    Parse { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: &str) -> Self {
        Self::Invalid {
            key,
            reason: reason.to_string(),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Queue unmatched tasks instead of failing the dispatch
    pub enable_task_queue: bool,
    /// Maximum pending tasks kept; the oldest is dropped when full
    pub task_queue_capacity: usize,
    /// Serve repeated task ids from the executor's result cache
    pub reuse_cached_results: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enable_task_queue: true,
            task_queue_capacity: 10_000,
            reuse_cached_results: true,
        }
    }
}

impl CoordinatorConfig {
    /// Build from a free-form JSON mapping, e.g. `{"enable_task_queue": false}`.
    ///
    /// Unknown keys are ignored, missing keys take their defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|_| ConfigError::Parse {
            key: "coordinator",
            value: value.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_task_queue && self.task_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "task_queue_capacity",
                "must be positive when the task queue is enabled",
            ));
        }
        Ok(())
    }
}

/// Bounded executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Admission slots (counting semaphore size)
    pub max_concurrent_tasks: usize,
    /// Maximum cached results (LRU)
    pub result_cache_size: usize,
    /// Age after which task bookkeeping is reclaimed, in seconds
    pub task_ttl_secs: u64,
    /// Hard per-task timeout, in seconds
    pub task_timeout_secs: u64,
    /// Period of the reclamation sweep, in seconds
    pub cleanup_interval_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 100,
            result_cache_size: 1000,
            task_ttl_secs: 3600,
            task_timeout_secs: 300,
            cleanup_interval_secs: 300,
        }
    }
}

impl ExecutorConfig {
    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::invalid("max_concurrent_tasks", "must be positive"));
        }
        if self.result_cache_size == 0 {
            return Err(ConfigError::invalid("result_cache_size", "must be positive"));
        }
        if self.task_timeout_secs == 0 {
            return Err(ConfigError::invalid("task_timeout_secs", "must be positive"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::invalid("cleanup_interval_secs", "must be positive"));
        }
        Ok(())
    }
}

/// Process configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub coordinator: CoordinatorConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup (env, test maps).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let coord_defaults = CoordinatorConfig::default();
        let exec_defaults = ExecutorConfig::default();

        let coordinator = CoordinatorConfig {
            enable_task_queue: parse_bool(&lookup, "LEGION_ENABLE_TASK_QUEUE")?
                .unwrap_or(coord_defaults.enable_task_queue),
            task_queue_capacity: parse_num(&lookup, "LEGION_TASK_QUEUE_CAPACITY")?
                .unwrap_or(coord_defaults.task_queue_capacity),
            reuse_cached_results: parse_bool(&lookup, "LEGION_REUSE_CACHED_RESULTS")?
                .unwrap_or(coord_defaults.reuse_cached_results),
        };

        let executor = ExecutorConfig {
            max_concurrent_tasks: parse_num(&lookup, "LEGION_MAX_CONCURRENT_TASKS")?
                .unwrap_or(exec_defaults.max_concurrent_tasks),
            result_cache_size: parse_num(&lookup, "LEGION_RESULT_CACHE_SIZE")?
                .unwrap_or(exec_defaults.result_cache_size),
            task_ttl_secs: parse_num(&lookup, "LEGION_TASK_TTL_SECS")?
                .unwrap_or(exec_defaults.task_ttl_secs),
            task_timeout_secs: parse_num(&lookup, "LEGION_TASK_TIMEOUT_SECS")?
                .unwrap_or(exec_defaults.task_timeout_secs),
            cleanup_interval_secs: parse_num(&lookup, "LEGION_CLEANUP_INTERVAL_SECS")?
                .unwrap_or(exec_defaults.cleanup_interval_secs),
        };

        let config = Self {
            coordinator,
            executor,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator.validate()?;
        self.executor.validate()
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Parse { key, value: v }),
        },
    }
}

fn parse_num<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { key, value: v }),
    }
}
