//! Application configuration.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Ops HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Search index configuration.
    pub search: SearchConfig,
    /// Broker consumer configuration.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Outbox recovery configuration.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Batch indexer configuration.
    #[serde(default)]
    pub indexer: IndexerConfig,
    /// Feature gates for change capture.
    #[serde(default)]
    pub features: FeatureGates,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ops server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Search index configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// `OpenSearch` node URL.
    pub url: String,
    /// Prefix prepended to every index name.
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    /// Basic auth username.
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// Request timeout in milliseconds.
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
}

impl SearchConfig {
    /// Request timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Broker consumer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Idle poll interval when a queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// First reconnect delay after a broker failure.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Lease TTL for single-active-consumer queues.
    #[serde(default = "default_consumer_lease_ms")]
    pub consumer_lease_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            consumer_lease_ms: default_consumer_lease_ms(),
        }
    }
}

/// Outbox recovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Recovery cycle interval.
    #[serde(default = "default_outbox_interval_ms")]
    pub interval_ms: u64,
    /// Records fetched per cycle.
    #[serde(default = "default_outbox_batch_size")]
    pub batch_size: u64,
    /// Lock TTL guarding a cycle.
    #[serde(default = "default_outbox_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_outbox_interval_ms(),
            batch_size: default_outbox_batch_size(),
            lock_ttl_ms: default_outbox_lock_ttl_ms(),
        }
    }
}

/// Batch indexer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Drain cycle interval.
    #[serde(default = "default_indexer_interval_ms")]
    pub interval_ms: u64,
    /// Events popped per batch.
    #[serde(default = "default_indexer_batch_size")]
    pub batch_size: usize,
    /// Bulk attempts before retryable items are handed back to the pending queue.
    #[serde(default = "default_indexer_max_attempts")]
    pub max_attempts: u32,
    /// Base delay of the bulk retry backoff.
    #[serde(default = "default_indexer_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Lock TTL guarding a drain cycle.
    #[serde(default = "default_indexer_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Contracts read per backfill page.
    #[serde(default = "default_backfill_page_size")]
    pub backfill_page_size: u64,
    /// Full token backfill cadence in seconds; 0 disables the schedule.
    #[serde(default)]
    pub backfill_interval_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_indexer_interval_ms(),
            batch_size: default_indexer_batch_size(),
            max_attempts: default_indexer_max_attempts(),
            retry_base_ms: default_indexer_retry_base_ms(),
            lock_ttl_ms: default_indexer_lock_ttl_ms(),
            backfill_page_size: default_backfill_page_size(),
            backfill_interval_secs: 0,
        }
    }
}

/// Feature gates consulted by change-capture handlers.
#[derive(Debug, Clone, Deserialize)]
pub struct FeatureGates {
    /// Emit a reindex job when a token row is inserted.
    #[serde(default = "default_true")]
    pub index_tokens_on_insert: bool,
    /// Emit a transaction join job when an activity row is inserted.
    #[serde(default = "default_true")]
    pub join_activities_on_insert: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self {
            index_tokens_on_insert: true,
            join_activities_on_insert: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human readable format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3100
}

const fn default_max_connections() -> u32 {
    50
}

const fn default_min_connections() -> u32 {
    5
}

fn default_redis_prefix() -> String {
    "blockfeed".to_string()
}

fn default_index_prefix() -> String {
    "blockfeed".to_string()
}

const fn default_search_timeout_ms() -> u64 {
    30_000
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_reconnect_initial_ms() -> u64 {
    500
}

const fn default_reconnect_max_ms() -> u64 {
    30_000
}

const fn default_consumer_lease_ms() -> u64 {
    15_000
}

const fn default_outbox_interval_ms() -> u64 {
    1_000
}

const fn default_outbox_batch_size() -> u64 {
    100
}

const fn default_outbox_lock_ttl_ms() -> u64 {
    30_000
}

const fn default_indexer_interval_ms() -> u64 {
    2_000
}

const fn default_indexer_batch_size() -> usize {
    500
}

const fn default_indexer_max_attempts() -> u32 {
    3
}

const fn default_indexer_retry_base_ms() -> u64 {
    500
}

const fn default_indexer_lock_ttl_ms() -> u64 {
    60_000
}

const fn default_backfill_page_size() -> u64 {
    500
}

const fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `BLOCKFEED_ENV`)
    /// 3. Environment variables with `BLOCKFEED_` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("BLOCKFEED_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("BLOCKFEED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("BLOCKFEED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let raw = r#"
            [database]
            url = "postgres://localhost/blockfeed"

            [redis]
            url = "redis://localhost:6379"

            [search]
            url = "http://localhost:9200"
        "#;

        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .and_then(config::Config::try_deserialize)
            .unwrap();

        assert_eq!(config.server.port, 3100);
        assert_eq!(config.redis.prefix, "blockfeed");
        assert_eq!(config.outbox.interval_ms, 1_000);
        assert_eq!(config.indexer.batch_size, 500);
        assert!(config.features.index_tokens_on_insert);
        assert!(!config.logging.json);
        assert_eq!(config.search.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_feature_gate_override() {
        let raw = r#"
            [database]
            url = "postgres://localhost/blockfeed"

            [redis]
            url = "redis://localhost:6379"

            [search]
            url = "http://localhost:9200"

            [features]
            index_tokens_on_insert = false
        "#;

        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .and_then(config::Config::try_deserialize)
            .unwrap();

        assert!(!config.features.index_tokens_on_insert);
        assert!(config.features.join_activities_on_insert);
    }
}
