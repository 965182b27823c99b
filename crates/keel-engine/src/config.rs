//! Configuration for the keel engine

use keel_queue::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Workspace served by this engine
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Event stream
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Reconcile queue backend
    #[serde(default)]
    pub queue: QueueConfig,

    /// Reconcile worker
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Job eligibility
    #[serde(default)]
    pub eligibility: EligibilityConfig,

    /// Claim-check batch cache
    #[serde(default)]
    pub batch_cache: BatchCacheConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace id; events for other workspaces are skipped
    #[serde(default = "default_workspace_id")]
    pub id: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            id: default_workspace_id(),
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Topic carrying workspace events
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Partition count used when the topic is created
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Consumer group id
    #[serde(default = "default_group")]
    pub group: String,

    /// Read timeout in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Pause before re-reading an event that failed with a retriable error
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            partitions: default_partitions(),
            group: default_group(),
            read_timeout_ms: default_read_timeout(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl BrokerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Reconcile queue configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueConfig {
    /// In-memory queue (single node, tests)
    #[default]
    Memory,

    /// PostgreSQL queue
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Job eligibility configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityConfig {
    /// Retry limit when no policy sets one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
        }
    }
}

/// Claim-check batch cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCacheConfig {
    /// Seconds a published batch stays retrievable
    #[serde(default = "default_batch_ttl")]
    pub ttl_secs: u64,
}

impl Default for BatchCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_batch_ttl(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_workspace_id() -> String {
    "default".to_string()
}

fn default_topic() -> String {
    "workspace-events".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_group() -> String {
    "keel-engine".to_string()
}

fn default_read_timeout() -> u64 {
    500
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    keel_policy::DEFAULT_MAX_RETRIES
}

fn default_batch_ttl() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration: defaults, then the optional file, then `KEEL__*`
    /// environment variables (`KEEL__QUEUE__URL`, `KEEL__WORKER__BATCH_SIZE`, ...)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("KEEL")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.workspace.id, "default");
        assert!(matches!(config.queue, QueueConfig::Memory));
        assert_eq!(config.eligibility.default_max_retries, 3);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_broker_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.topic, "workspace-events");
        assert_eq!(config.partitions, 4);
        assert_eq!(config.read_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_batch_cache_defaults() {
        assert_eq!(BatchCacheConfig::default().ttl_secs, 300);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "workspace": {{"id": "ws-1"}},
                "queue": {{"type": "postgres", "url": "postgres://localhost/keel"}},
                "eligibility": {{"default_max_retries": 5}}
            }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.workspace.id, "ws-1");
        assert_eq!(config.eligibility.default_max_retries, 5);
        match config.queue {
            QueueConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                assert_eq!(url, "postgres://localhost/keel");
                assert_eq!(max_connections, 10);
                assert_eq!(connect_timeout_secs, 5);
            }
            QueueConfig::Memory => panic!("expected postgres queue"),
        }
        assert_eq!(config.broker.group, "keel-engine");
    }
}
