//! PostgreSQL settings of the execution store.
//!
//! Only read when `FLOWRUN_STORAGE=postgres`. The pool built from them stores
//! the execution rows and backs the locks of the mutation protocol.

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

/// Execution store connection, read from `POSTGRES_*` variables:
/// - `POSTGRES_HOST`, `POSTGRES_PORT` (default `localhost:5432`)
/// - `POSTGRES_USER`, `POSTGRES_PASSWORD`
/// - `POSTGRES_DATABASE` (default `flowrun`)
/// - `POSTGRES_SCHEMA`: schema the execution tables are created in at
///   startup (default `flowrun`)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_database")]
    pub database: String,

    /// Schema of the `executions` table and its indexes
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Upper bound of pooled connections. Every locked mutation holds one
    /// for the length of its transaction.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a free pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> String {
    "5432".to_string()
}

fn default_user() -> String {
    "flowrun".to_string()
}

fn default_database() -> String {
    "flowrun".to_string()
}

fn default_schema() -> String {
    "flowrun".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    30
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POSTGRES_").from_env::<DatabaseConfig>()
    }

    /// Connection options of the execution store. Unqualified table names
    /// resolve in the configured schema.
    pub fn connect_options(&self) -> PgConnectOptions {
        let port: u16 = self.port.parse().unwrap_or(5432);

        PgConnectOptions::new()
            .host(&self.host)
            .port(port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .options([("search_path", self.schema.as_str())])
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            database: default_database(),
            schema: default_schema(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, "5432");
        assert_eq!(config.database, "flowrun");
        assert_eq!(config.schema, "flowrun");
    }

    #[test]
    fn test_connect_options_target_configured_database() {
        let config = DatabaseConfig {
            host: "db.internal".to_string(),
            port: "not-a-port".to_string(),
            database: "executions".to_string(),
            ..Default::default()
        };
        let options = config.connect_options();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("executions"));
    }
}
