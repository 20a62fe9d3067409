//! Worker engine configuration.

use std::time::Duration;

use jobmq_core::config::{env_lookup, parse_var};
use jobmq_core::{ConfigError, ConnectionConfig};

const DEFAULT_PREFETCH: u16 = 1;
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 1;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Used when `queue_capacity` is left at zero: enough to hold one full
/// prefetch window without blocking the consumer.
const MIN_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub connection: ConnectionConfig,
    /// Queue to consume from. Mutually exclusive with `exchange`.
    pub queue: String,
    /// Exchange to bind a private anonymous queue to.
    pub exchange: String,
    /// Unacknowledged deliveries the broker may hand this engine; `0` is
    /// unlimited.
    pub prefetch_count: u16,
    /// Handlers allowed to run at the same time.
    pub max_concurrent_jobs: usize,
    /// How long the poll loop blocks on an empty queue before re-checking
    /// for pause and stop requests.
    pub poll_timeout: Duration,
    /// Capacity of the hand-off queue between consumer and poll loop.
    /// `0` derives it from prefetch and pool size.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: String::new(),
            exchange: String::new(),
            prefetch_count: DEFAULT_PREFETCH,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            queue_capacity: 0,
        }
    }
}

impl EngineConfig {
    /// Consume from a fixed, shared queue.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }

    /// Consume from a private queue bound to `exchange`.
    pub fn for_exchange(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ..Default::default()
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Load from environment variables.
    ///
    /// | Env Var                      | Default |
    /// |------------------------------|---------|
    /// | `WORKER_QUEUE`               | --      |
    /// | `WORKER_EXCHANGE`            | --      |
    /// | `WORKER_PREFETCH`            | `1`     |
    /// | `WORKER_MAX_CONCURRENT_JOBS` | `1`     |
    /// | `WORKER_POLL_TIMEOUT_MS`     | `100`   |
    ///
    /// plus the `BROKER_*` variables. Exactly one of `WORKER_QUEUE` and
    /// `WORKER_EXCHANGE` must be set; [`validate`](Self::validate) checks
    /// this when the engine is built.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let poll_ms = parse_var(&lookup, "WORKER_POLL_TIMEOUT_MS", DEFAULT_POLL_TIMEOUT_MS)?;
        Ok(Self {
            connection: ConnectionConfig::from_lookup(&lookup)?,
            queue: lookup("WORKER_QUEUE").unwrap_or_default().trim().to_string(),
            exchange: lookup("WORKER_EXCHANGE").unwrap_or_default().trim().to_string(),
            prefetch_count: parse_var(&lookup, "WORKER_PREFETCH", DEFAULT_PREFETCH)?,
            max_concurrent_jobs: parse_var(
                &lookup,
                "WORKER_MAX_CONCURRENT_JOBS",
                DEFAULT_MAX_CONCURRENT_JOBS,
            )?,
            poll_timeout: Duration::from_millis(poll_ms),
            queue_capacity: 0,
        })
    }

    /// Check the settings an engine cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.queue.is_empty(), self.exchange.is_empty()) {
            (true, true) => return Err(ConfigError::Missing("WORKER_QUEUE or WORKER_EXCHANGE")),
            (false, false) => {
                return Err(ConfigError::Invalid {
                    key: "WORKER_EXCHANGE",
                    message: "set either a queue or an exchange, not both".into(),
                })
            }
            _ => {}
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_MAX_CONCURRENT_JOBS",
                message: "must be at least 1".into(),
            });
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "WORKER_POLL_TIMEOUT_MS",
                message: "must be greater than 0".into(),
            });
        }

        if self.prefetch_count != 0 && usize::from(self.prefetch_count) < self.max_concurrent_jobs {
            tracing::warn!(
                prefetch_count = self.prefetch_count,
                max_concurrent_jobs = self.max_concurrent_jobs,
                "Prefetch is below the pool size; some workers will sit idle",
            );
        }
        Ok(())
    }

    /// Effective hand-off queue capacity.
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            return self.queue_capacity;
        }
        usize::from(self.prefetch_count)
            .max(self.max_concurrent_jobs)
            .max(MIN_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn queue_config_with_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[("WORKER_QUEUE", "work")])).expect("config");
        assert_eq!(config.queue, "work");
        assert!(config.exchange.is_empty());
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
    }

    #[test]
    fn needs_queue_or_exchange() {
        let neither = EngineConfig::from_lookup(lookup(&[])).expect("parse");
        assert_matches!(neither.validate(), Err(ConfigError::Missing(_)));

        let both =
            EngineConfig::from_lookup(lookup(&[("WORKER_QUEUE", "q"), ("WORKER_EXCHANGE", "x")]))
                .expect("parse");
        assert_matches!(
            both.validate(),
            Err(ConfigError::Invalid { key: "WORKER_EXCHANGE", .. })
        );
    }

    #[test]
    fn numeric_settings_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("WORKER_EXCHANGE", "commands"),
            ("WORKER_PREFETCH", "8"),
            ("WORKER_MAX_CONCURRENT_JOBS", "4"),
            ("WORKER_POLL_TIMEOUT_MS", "250"),
        ]))
        .expect("config");
        assert_eq!(config.exchange, "commands");
        assert_eq!(config.prefetch_count, 8);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.poll_timeout, Duration::from_millis(250));
    }

    #[test]
    fn zero_pool_size_is_invalid() {
        let config = EngineConfig::for_queue("work").with_max_concurrent_jobs(0);
        assert_matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "WORKER_MAX_CONCURRENT_JOBS", .. })
        );
    }

    #[test]
    fn queue_capacity_covers_prefetch_window() {
        let config = EngineConfig::for_queue("work").with_prefetch(64);
        assert_eq!(config.effective_queue_capacity(), 64);
        assert_eq!(EngineConfig::for_queue("work").effective_queue_capacity(), MIN_QUEUE_CAPACITY);
    }
}
