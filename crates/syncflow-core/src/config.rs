//! Syncflow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defaults: TaskDefaults,
}

impl OrchestratorConfig {
    /// Load config from `SYNCFLOW_CONFIG` or the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = std::env::var("SYNCFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)
            .map_err(|e| OrchestratorError::Config(format!("Failed to parse config: {e}")))?;
        if config.server.api_key.is_none() {
            config.server.api_key = std::env::var("SYNCFLOW_API_KEY")
                .ok()
                .filter(|k| !k.is_empty());
        }
        Ok(config)
    }

    /// Get the default config path (~/.syncflow/config.toml).
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the syncflow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".syncflow")
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared bearer secret for `/v1` routes. None = open.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "bool_true")]
    pub request_log: bool,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Upper bound for any blocking wait (output wait, long-poll dequeue).
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 3008 }
fn bool_true() -> bool { true }
fn default_max_body_bytes() -> usize { 10 * 1024 * 1024 }
fn default_max_wait_ms() -> u64 { 120_000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
            request_log: true,
            max_body_bytes: default_max_body_bytes(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

/// Task/Schedule store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `:memory:` keeps everything in process.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Attempts for read paths (search, dequeue) on `StoreUnavailable`.
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_read_retry_backoff_ms")]
    pub read_retry_backoff_ms: u64,
}

fn default_store_path() -> String { "~/.syncflow/orchestrator.db".into() }
fn default_busy_timeout_ms() -> u64 { 5_000 }
fn default_read_retries() -> u32 { 3 }
fn default_read_retry_backoff_ms() -> u64 { 50 }

impl StoreConfig {
    /// Store path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            read_retries: default_read_retries(),
            read_retry_backoff_ms: default_read_retry_backoff_ms(),
        }
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval_ms() -> u64 { 1_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Retry/timeout policy applied to tasks that do not carry their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefaults {
    #[serde(default)]
    pub retry_max: u32,
    #[serde(default = "default_created_to_started_timeout_ms")]
    pub created_to_started_timeout_ms: u64,
    #[serde(default = "default_started_to_completed_timeout_ms")]
    pub started_to_completed_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

fn default_created_to_started_timeout_ms() -> u64 { 60 * 60 * 1000 }
fn default_started_to_completed_timeout_ms() -> u64 { 24 * 60 * 60 * 1000 }
fn default_heartbeat_timeout_ms() -> u64 { 5 * 60 * 1000 }

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            retry_max: 0,
            created_to_started_timeout_ms: default_created_to_started_timeout_ms(),
            started_to_completed_timeout_ms: default_started_to_completed_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let cfg = OrchestratorConfig::parse("").unwrap();
        assert_eq!(cfg.server.port, 3008);
        assert_eq!(cfg.scheduler.tick_interval_ms, 1_000);
        assert_eq!(cfg.defaults.retry_max, 0);
        assert!(cfg.server.request_log);
    }

    #[test]
    fn test_partial_sections() {
        let cfg = OrchestratorConfig::parse(
            r#"
            [server]
            port = 9000

            [store]
            path = ":memory:"

            [defaults]
            retry_max = 2
            heartbeat_timeout_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.store.resolved_path(), PathBuf::from(":memory:"));
        assert_eq!(cfg.defaults.retry_max, 2);
        assert_eq!(cfg.defaults.heartbeat_timeout_ms, 1000);
        assert_eq!(cfg.defaults.created_to_started_timeout_ms, 3_600_000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OrchestratorConfig::parse("[server\nport=").unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn test_tilde_expansion() {
        let store = StoreConfig::default();
        assert!(!store.resolved_path().to_string_lossy().starts_with('~'));
    }
}
