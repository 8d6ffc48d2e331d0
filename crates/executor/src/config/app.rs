//! Application configuration for the flowrun executor.

use std::time::Duration;

use serde::Deserialize;

/// Storage backend for executions and triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Single-process storage, lost on restart
    Memory,
    /// Shared PostgreSQL storage with row locks
    Postgres,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FLOWRUN_`:
/// - `FLOWRUN_HOST`: Server bind address (default: "0.0.0.0")
/// - `FLOWRUN_PORT`: Server port (default: 8080)
/// - `FLOWRUN_SERVER_NAME`: Server name for identification
/// - `FLOWRUN_STORAGE`: `memory` or `postgres` (default: memory)
/// - `FLOWRUN_NATS_URL`: NATS URL, enables the NATS queue (optional)
/// - `FLOWRUN_FLOWS_DIR`: Directory of YAML flows loaded at startup (optional)
/// - `FLOWRUN_LOCK_TIMEOUT_MS`: Bound on execution lock acquisition
/// - `FLOWRUN_SCHEDULER_INTERVAL_MS`: Trigger scan period
/// - `FLOWRUN_LOG_JSON`: Emit JSON log lines
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Storage backend
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Flow definitions directory (optional)
    #[serde(default)]
    pub flows_dir: Option<String>,

    /// Lock acquisition bound in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Scheduler tick in milliseconds
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,

    /// Capacity of the in-memory queues
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// JSON log output
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "flowrun-executor".to_string()
}

fn default_storage() -> StorageBackend {
    StorageBackend::Memory
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_scheduler_interval_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    1_024
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `FLOWRUN_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOWRUN_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            storage: default_storage(),
            nats_url: None,
            flows_dir: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            queue_capacity: default_queue_capacity(),
            log_json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.lock_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_storage_backend_deserialization() {
        let backend: StorageBackend = serde_json::from_str("\"postgres\"").unwrap();
        assert_eq!(backend, StorageBackend::Postgres);
    }
}
