//! Dispatcher configuration.

use std::fmt;
use std::str::FromStr;

use jobmq_core::config::{env_lookup, parse_var, required_var};
use jobmq_core::{ConfigError, ConnectionConfig};

/// Default prefetch limit on the dispatcher's channel.
const DEFAULT_PREFETCH: u16 = 1;

/// How a batch is split into broker messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// One message per job, so workers share the batch.
    #[default]
    PerJob,
    /// The whole batch in one message, executed by a single worker.
    Bundled,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per-job" | "per_job" | "perjob" => Ok(Self::PerJob),
            "bundled" | "bundle" => Ok(Self::Bundled),
            other => Err(format!("unknown dispatch mode '{other}' (expected per-job or bundled)")),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerJob => f.write_str("per-job"),
            Self::Bundled => f.write_str("bundled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub connection: ConnectionConfig,
    /// Shared work queue jobs are published to.
    pub queue: String,
    /// Prefetch limit for the reply consumer. `0` means unlimited.
    pub prefetch_count: u16,
    pub mode: DispatchMode,
}

impl DispatcherConfig {
    /// Default settings for publishing to `queue`.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::default(),
            queue: queue.into(),
            prefetch_count: DEFAULT_PREFETCH,
            mode: DispatchMode::default(),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Load from environment variables.
    ///
    /// | Env Var             | Default    |
    /// |---------------------|------------|
    /// | `DISPATCH_QUEUE`    | (required) |
    /// | `DISPATCH_PREFETCH` | `1`        |
    /// | `DISPATCH_MODE`     | `per-job`  |
    ///
    /// plus the `BROKER_*` variables read by [`ConnectionConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            connection: ConnectionConfig::from_lookup(&lookup)?,
            queue: required_var(&lookup, "DISPATCH_QUEUE")?,
            prefetch_count: parse_var(&lookup, "DISPATCH_PREFETCH", DEFAULT_PREFETCH)?,
            mode: parse_var(&lookup, "DISPATCH_MODE", DispatchMode::default())?,
        })
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
    fn queue_is_required() {
        let result = DispatcherConfig::from_lookup(lookup(&[]));
        assert_matches!(result, Err(ConfigError::Missing("DISPATCH_QUEUE")));
    }

    #[test]
    fn defaults_apply() {
        let config = DispatcherConfig::from_lookup(lookup(&[("DISPATCH_QUEUE", "jobs")]))
            .expect("config");
        assert_eq!(config.queue, "jobs");
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.mode, DispatchMode::PerJob);
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn mode_and_prefetch_are_parsed() {
        let config = DispatcherConfig::from_lookup(lookup(&[
            ("DISPATCH_QUEUE", "jobs"),
            ("DISPATCH_PREFETCH", "0"),
            ("DISPATCH_MODE", "Bundled"),
            ("BROKER_HOST", "mq.internal"),
        ]))
        .expect("config");
        assert_eq!(config.prefetch_count, 0);
        assert_eq!(config.mode, DispatchMode::Bundled);
        assert_eq!(config.connection.host, "mq.internal");
    }

    #[test]
    fn unknown_mode_is_invalid() {
        let result = DispatcherConfig::from_lookup(lookup(&[
            ("DISPATCH_QUEUE", "jobs"),
            ("DISPATCH_MODE", "scatter"),
        ]));
        assert_matches!(result, Err(ConfigError::Invalid { key: "DISPATCH_MODE", .. }));
    }
}
