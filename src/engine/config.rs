use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Backoff shape selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Uniform,
    Exponential,
    Linear,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    /// Executions allowed per task, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,

    /// Uniform delay, exponential initial delay or linear base delay.
    #[serde(default)]
    pub delay_ms: u64,

    /// Linear backoff only.
    #[serde(default)]
    pub increment_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            delay_ms: 0,
            increment_ms: 0,
        }
    }
}

/// Resilience settings for remote nodes
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RemoteConfig {
    /// Extra attempts allowed after a successful reconnection.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Faults tolerated inside one window before requests fail fast.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_window")]
    pub circuit_window_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            circuit_breaker_threshold: default_circuit_threshold(),
            circuit_window_ms: default_circuit_window(),
        }
    }
}

impl RemoteConfig {
    pub fn circuit_window(&self) -> Duration {
        Duration::from_millis(self.circuit_window_ms)
    }
}

// Default value functions for serde
fn default_task_timeout() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    1
}

fn default_backoff() -> BackoffKind {
    BackoffKind::Uniform
}

fn default_retry_budget() -> u32 {
    1
}

fn default_circuit_threshold() -> u32 {
    10
}

fn default_circuit_window() -> u64 {
    1000
}

fn default_logging_level() -> Option<String> {
    Some("info".to_string())
}

fn default_metrics_port() -> u16 {
    9000
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    /// Time box for one task attempt, and separately for its cleanup.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default = "default_logging_level")]
    pub logging_level: Option<String>,

    #[serde(default)]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl SchedulerConfig {
    /// Load config from YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: SchedulerConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("YAML parsing error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from TOML file
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: SchedulerConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parsing error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the loader from the file extension (`.toml`, otherwise YAML)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(path),
            _ => Self::from_yaml(path),
        }
    }

    /// Default configuration
    pub fn defaults() -> Self {
        Self {
            task_timeout_ms: default_task_timeout(),
            retry: RetryConfig::default(),
            remote: RemoteConfig::default(),
            logging_level: default_logging_level(),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Get normalized logging level (lowercase)
    pub fn get_logging_level(&self) -> String {
        self.logging_level
            .clone()
            .unwrap_or_else(|| "info".to_string())
            .to_lowercase()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "task_timeout_ms must be > 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be >= 1".into(),
            ));
        }

        if self.remote.circuit_window_ms == 0 {
            return Err(ConfigError::ValidationError(
                "remote.circuit_window_ms must be > 0".into(),
            ));
        }

        if self.metrics_enabled && self.metrics_port == 0 {
            return Err(ConfigError::ValidationError(
                "metrics_port cannot be 0 when metrics are enabled".into(),
            ));
        }

        if let Some(level) = &self.logging_level {
            let level = level.to_lowercase();
            let allowed = ["trace", "debug", "info", "warn", "error"];
            if !allowed.contains(&level.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "invalid logging_level '{}'. Must be one of: {:?}",
                    level, allowed
                )));
            }
        }

        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::defaults()
    }
}
