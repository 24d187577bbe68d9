use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::backend::BackendKind;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Shared key required in `X-API-Key` for `/api/v1/*`. Unset means open.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Pub/sub channel used for cross-replica fanout
    #[serde(default = "default_redis_channel")]
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Which backend to run: `memory`, `redis` or `postgres`
    #[serde(default)]
    pub backend: BackendKind,
    /// Lifetime of stored QUEUED notifications
    #[serde(default = "default_queued_ttl")]
    pub queued_ttl_seconds: u64,
    /// Lifetime of stored TIMESERIES notifications
    #[serde(default = "default_timeseries_ttl")]
    pub timeseries_ttl_seconds: u64,
    /// How often the TTL sweep runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// LISTEN/NOTIFY channel for the postgres backend
    #[serde(default = "default_notify_channel")]
    pub notify_channel: String,
    /// Liveness probe interval on the dedicated listener connection
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_seconds: u64,
    /// Idle time after which a stream consumer emits a keepalive event
    #[serde(default = "default_stream_keepalive")]
    pub stream_keepalive_seconds: u64,
    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_channel() -> String {
    "notify:fanout".to_string()
}

fn default_database_url() -> String {
    "postgres://localhost:5432/notify".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_queued_ttl() -> u64 {
    86_400 // 24 hours
}

fn default_timeseries_ttl() -> u64 {
    604_800 // 7 days
}

fn default_sweep_interval() -> u64 {
    600 // 10 minutes
}

fn default_notify_channel() -> String {
    "notify_fanout".to_string()
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_stream_keepalive() -> u64 {
    15
}

fn default_reconnect_initial_delay() -> u64 {
    1_000
}

fn default_reconnect_max_delay() -> u64 {
    60_000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("notifications.backend", "memory")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // NOTIFY__SERVER__PORT, NOTIFY__NOTIFICATIONS__BACKEND, ...
            .add_source(
                Environment::with_prefix("NOTIFY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
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

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            channel: default_redis_channel(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            queued_ttl_seconds: default_queued_ttl(),
            timeseries_ttl_seconds: default_timeseries_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
            notify_channel: default_notify_channel(),
            keepalive_interval_seconds: default_keepalive_interval(),
            stream_keepalive_seconds: default_stream_keepalive(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8081);
    }

    #[test]
    fn test_notification_policy_defaults() {
        let config = NotificationConfig::default();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.queued_ttl_seconds, 24 * 60 * 60);
        assert_eq!(config.timeseries_ttl_seconds, 7 * 24 * 60 * 60);
        assert_eq!(config.sweep_interval_seconds, 10 * 60);
        assert_eq!(config.reconnect_initial_delay_ms, 1_000);
        assert_eq!(config.reconnect_max_delay_ms, 60_000);
    }

    #[test]
    fn test_unknown_backend_fails_fast() {
        let result = Config::builder()
            .set_default("notifications.backend", "carrier-pigeon")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<Settings>();

        assert!(result.is_err());
    }

    #[test]
    fn test_backend_from_config_source() {
        let settings = Config::builder()
            .set_default("notifications.backend", "postgres")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<Settings>()
            .unwrap();

        assert_eq!(settings.notifications.backend, BackendKind::Postgres);
        assert_eq!(settings.redis.channel, "notify:fanout");
    }
}
