use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::postgres::PoolOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Deployment environment name (`RUN_MODE`)
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_user")]
    pub user: String,
    #[serde(default = "default_db_password")]
    pub password: String,
    /// Maximum number of physical connections
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    /// Idle connections older than this are closed instead of reused
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Upper bound on waiting for a connection (slot wait plus connect)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Server-side `statement_timeout` applied to every session
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// Queries slower than this are logged at warn level
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,
    /// Maximum callers allowed to queue for a connection (unbounded when unset)
    #[serde(default)]
    pub max_waiting_clients: Option<usize>,
    /// How long shutdown waits for outstanding leases before terminating them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Connectivity attempts made before the server starts accepting traffic
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    #[serde(default = "default_startup_retry_delay_ms")]
    pub startup_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otel_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_name() -> String {
    "gaia_commons".to_string()
}

fn default_db_user() -> String {
    "gaia_user".to_string()
}

fn default_db_password() -> String {
    "gaia_password".to_string()
}

fn default_max_pool_size() -> u32 {
    20
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

fn default_slow_query_threshold_ms() -> u64 {
    1_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_startup_retries() -> u32 {
    5
}

fn default_startup_retry_delay_ms() -> u64 {
    2_000
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "gaia-commons-api".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

/// Flat variables used by existing deployments, mapped onto nested keys.
/// They take precedence over every other source.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("DB_HOST", "database.host"),
    ("DB_PORT", "database.port"),
    ("DB_NAME", "database.name"),
    ("DB_USER", "database.user"),
    ("DB_PASSWORD", "database.password"),
    ("DB_POOL_MAX", "database.max_pool_size"),
    ("DB_IDLE_TIMEOUT", "database.idle_timeout_ms"),
    ("DB_CONNECTION_TIMEOUT", "database.connect_timeout_ms"),
    ("DB_STATEMENT_TIMEOUT", "database.statement_timeout_ms"),
    ("DB_SLOW_QUERY_MS", "database.slow_query_threshold_ms"),
    ("PORT", "server.port"),
    ("RUN_MODE", "environment"),
];

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        Self::from_env(env::vars().collect())
    }

    /// Build settings from an explicit set of environment variables.
    pub fn from_env(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let run_mode = vars
            .get("RUN_MODE")
            .cloned()
            .unwrap_or_else(|| "development".into());

        let mut builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("database.port", 5432)?
            .set_default("database.max_pool_size", 20)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // DATABASE__MAX_POOL_SIZE, SERVER__PORT, OTEL__ENABLED, etc.
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(vars.clone())),
            );

        for (var, key) in LEGACY_ENV_KEYS {
            builder = builder.set_override_option(*key, vars.get(*var).cloned())?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production" || self.environment == "prod"
    }
}

impl DatabaseConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn startup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.startup_retry_delay_ms)
    }

    /// Pool tuning derived from this configuration.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_size: self.max_pool_size.max(1) as usize,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            slow_query_threshold: Duration::from_millis(self.slow_query_threshold_ms),
            max_waiting_clients: self.max_waiting_clients,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: default_db_host(),
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_user(),
            password: default_db_password(),
            max_pool_size: default_max_pool_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            max_waiting_clients: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            startup_retries: default_startup_retries(),
            startup_retry_delay_ms: default_startup_retry_delay_ms(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_otel_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 3000);

        let db = DatabaseConfig::default();
        assert_eq!(db.port, 5432);
        assert_eq!(db.max_pool_size, 20);
        assert_eq!(db.idle_timeout_ms, 30_000);
        assert_eq!(db.connect_timeout_ms, 2_000);
        assert_eq!(db.statement_timeout_ms, 30_000);
        assert_eq!(db.slow_query_threshold_ms, 1_000);
        assert_eq!(db.shutdown_grace(), Duration::from_secs(10));
        assert!(db.max_waiting_clients.is_none());
    }

    #[test]
    fn test_from_empty_env_uses_defaults() {
        let settings = Settings::from_env(HashMap::new()).unwrap();
        assert_eq!(settings.environment, "development");
        assert_eq!(settings.database.name, "gaia_commons");
        assert_eq!(settings.server_addr(), "0.0.0.0:3000");
        assert!(!settings.otel.enabled);
    }

    #[test]
    fn test_nested_env_overrides() {
        let settings = Settings::from_env(vars(&[
            ("DATABASE__MAX_POOL_SIZE", "5"),
            ("DATABASE__HOST", "db.internal"),
            ("SERVER__PORT", "8080"),
        ]))
        .unwrap();

        assert_eq!(settings.database.max_pool_size, 5);
        assert_eq!(settings.database.host, "db.internal");
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn test_legacy_env_overrides_win() {
        let settings = Settings::from_env(vars(&[
            ("DATABASE__MAX_POOL_SIZE", "5"),
            ("DB_POOL_MAX", "7"),
            ("DB_CONNECTION_TIMEOUT", "500"),
            ("DB_NAME", "gaia_test"),
            ("PORT", "4000"),
            ("RUN_MODE", "production"),
        ]))
        .unwrap();

        assert_eq!(settings.database.max_pool_size, 7);
        assert_eq!(settings.database.connect_timeout_ms, 500);
        assert_eq!(settings.database.name, "gaia_test");
        assert_eq!(settings.server.port, 4000);
        assert!(settings.is_production());
    }

    #[test]
    fn test_pool_options_from_config() {
        let db = DatabaseConfig {
            max_pool_size: 3,
            slow_query_threshold_ms: 250,
            max_waiting_clients: Some(8),
            ..Default::default()
        };

        let options = db.pool_options();
        assert_eq!(options.max_size, 3);
        assert_eq!(options.connect_timeout, Duration::from_secs(2));
        assert_eq!(options.slow_query_threshold, Duration::from_millis(250));
        assert_eq!(options.max_waiting_clients, Some(8));
    }
}
