//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{MaintenanceConfig, PostgresChannelConfig, RetryPolicy};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: admin HTTP bind address (default: `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for text
/// - `DATABASE_URL`: Postgres connection string; in-memory backends if unset
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `SAGA_WORKER_CONCURRENCY`: deliveries processed at once (default: `8`)
/// - `SAGA_RETRY_*`: redelivery backoff
/// - `SAGA_RETENTION_DAYS`, `SAGA_PURGE_INTERVAL_SECS`: retention purge
/// - `SAGA_STALE_AFTER_SECS`, `SAGA_REPLAY_INTERVAL_SECS`, `SAGA_MAX_REPLAYS`: stale replay
/// - `SAGA_POLL_INTERVAL_MS`: Postgres channel poll period (default: `250`)
///
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub json_logs: bool,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub worker_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub retention_days: u64,
    pub purge_interval_secs: u64,
    pub stale_after_secs: u64,
    pub replay_interval_secs: u64,
    pub max_replays: i32,
    pub poll_interval_ms: u64,
}

impl ServerConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(lookup("PORT"), defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            json_logs: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(
                lookup("DATABASE_MAX_CONNECTIONS"),
                defaults.database_max_connections,
            ),
            worker_concurrency: parse_or(
                lookup("SAGA_WORKER_CONCURRENCY"),
                defaults.worker_concurrency,
            ),
            retry_max_attempts: parse_or(
                lookup("SAGA_RETRY_MAX_ATTEMPTS"),
                defaults.retry_max_attempts,
            ),
            retry_initial_delay_ms: parse_or(
                lookup("SAGA_RETRY_INITIAL_DELAY_MS"),
                defaults.retry_initial_delay_ms,
            ),
            retry_multiplier: parse_or(lookup("SAGA_RETRY_MULTIPLIER"), defaults.retry_multiplier),
            retry_max_delay_ms: parse_or(
                lookup("SAGA_RETRY_MAX_DELAY_MS"),
                defaults.retry_max_delay_ms,
            ),
            retention_days: parse_or(lookup("SAGA_RETENTION_DAYS"), defaults.retention_days),
            purge_interval_secs: parse_or(
                lookup("SAGA_PURGE_INTERVAL_SECS"),
                defaults.purge_interval_secs,
            ),
            stale_after_secs: parse_or(lookup("SAGA_STALE_AFTER_SECS"), defaults.stale_after_secs),
            replay_interval_secs: parse_or(
                lookup("SAGA_REPLAY_INTERVAL_SECS"),
                defaults.replay_interval_secs,
            ),
            max_replays: parse_or(lookup("SAGA_MAX_REPLAYS"), defaults.max_replays),
            poll_interval_ms: parse_or(lookup("SAGA_POLL_INTERVAL_MS"), defaults.poll_interval_ms),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_multiplier(self.retry_multiplier)
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }

    pub fn channel_config(&self) -> PostgresChannelConfig {
        PostgresChannelConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry: self.retry_policy(),
            ..PostgresChannelConfig::default()
        }
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            retention: Duration::from_secs(self.retention_days * 24 * 60 * 60),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            replay_interval: Duration::from_secs(self.replay_interval_secs),
            max_replays: self.max_replays,
            ..MaintenanceConfig::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            json_logs: false,
            database_url: None,
            database_max_connections: 10,
            worker_concurrency: 8,
            retry_max_attempts: 5,
            retry_initial_delay_ms: 1000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 60_000,
            retention_days: 30,
            purge_interval_secs: 3600,
            stale_after_secs: 300,
            replay_interval_secs: 60,
            max_replays: 3,
            poll_interval_ms: 250,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.max_replays, 3);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(from_map(&[]), ServerConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("DATABASE_URL", "postgres://localhost/sagas"),
            ("SAGA_WORKER_CONCURRENCY", "2"),
            ("SAGA_RETRY_MAX_ATTEMPTS", "7"),
            ("SAGA_RETENTION_DAYS", "1"),
        ]);

        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert!(config.json_logs);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/sagas"));
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.retry_policy().max_attempts, 7);
        assert_eq!(
            config.maintenance_config().retention,
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_map(&[("PORT", "not-a-port"), ("SAGA_RETRY_MULTIPLIER", "x"), ("DATABASE_URL", " ")]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.retry_multiplier, 2.0);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_channel_config_uses_retry_settings() {
        let config = from_map(&[("SAGA_POLL_INTERVAL_MS", "50"), ("SAGA_RETRY_INITIAL_DELAY_MS", "10")]);
        let channel = config.channel_config();

        assert_eq!(channel.poll_interval, Duration::from_millis(50));
        assert_eq!(channel.retry.delay_for(1), Duration::from_millis(10));
    }
}
