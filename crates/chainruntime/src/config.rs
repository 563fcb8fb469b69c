use chaincore::{NodeType, DEFAULT_SUBSCRIBER_BUFFER};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

/// Configuration for the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_parallel_nodes: usize,
    /// Per-attempt limit for a single node
    pub node_timeout_ms: Option<u64>,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    /// Per-subscriber queue length of the execution monitor
    pub monitor_buffer: usize,
    /// Pre-warm the servers a workflow uses before dispatching its nodes
    pub prewarm_servers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            node_timeout_ms: None,
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            monitor_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            prewarm_servers: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_nodes == 0 {
            return Err(ConfigError("max_parallel_nodes must be greater than 0".to_string()));
        }
        if self.monitor_buffer == 0 {
            return Err(ConfigError("monitor_buffer must be greater than 0".to_string()));
        }
        if self.node_timeout_ms == Some(0) {
            return Err(ConfigError("node_timeout_ms must be greater than 0".to_string()));
        }
        self.retry.validate()?;
        self.cache.validate()?;
        self.pool.validate()
    }

    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

/// Retry policy for retryable node failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError("retry.max_attempts must be at least 1".to_string()));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError("retry.backoff_multiplier must be >= 1.0".to_string()));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// How much of the cache capacity an entry consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheWeigher {
    /// Every entry weighs 1; capacity is an entry count
    Unit,
    /// Entries weigh their serialized output size in bytes
    SerializedBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum total weight held by the cache
    pub capacity: usize,
    pub ttl_ms: u64,
    pub weigher: CacheWeigher,
    /// Node types whose completed results are memoized. Condition nodes are
    /// never cached regardless of this list.
    pub cacheable_types: Vec<NodeType>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1_000,
            ttl_ms: 5 * 60 * 1_000,
            weigher: CacheWeigher::Unit,
            cacheable_types: vec![NodeType::Transform, NodeType::McpTool],
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.capacity == 0 {
            return Err(ConfigError("cache.capacity must be greater than 0".to_string()));
        }
        if self.enabled && self.ttl_ms == 0 {
            return Err(ConfigError("cache.ttl_ms must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Ceiling on open connections across all servers
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    /// How often the background worker looks for idle connections
    pub cleanup_interval_ms: u64,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 32,
            idle_timeout_ms: 5 * 60 * 1_000,
            cleanup_interval_ms: 30_000,
            acquire_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError("pool.max_connections must be greater than 0".to_string()));
        }
        if self.cleanup_interval_ms == 0 {
            return Err(ConfigError("pool.cleanup_interval_ms must be greater than 0".to_string()));
        }
        if self.acquire_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError("pool timeouts must be greater than 0".to_string()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 300,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(10), Duration::from_millis(300));
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = EngineConfig {
            max_parallel_nodes: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_parallel_nodes": 4, "retry": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.max_parallel_nodes, 4);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.pool.max_connections, 32);
    }
}
