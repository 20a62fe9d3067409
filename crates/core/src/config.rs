//! Broker connection settings and environment parsing helpers.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;

/// Where and how to reach the message broker.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub virtual_host: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            user: "guest".into(),
            password: "guest".into(),
            virtual_host: "/".into(),
        }
    }
}

impl ConnectionConfig {
    /// Load the connection settings from environment variables.
    ///
    /// | Env Var           | Default     |
    /// |-------------------|-------------|
    /// | `BROKER_HOST`     | `localhost` |
    /// | `BROKER_PORT`     | `5672`      |
    /// | `BROKER_USER`     | `guest`     |
    /// | `BROKER_PASSWORD` | `guest`     |
    /// | `BROKER_VHOST`    | `/`         |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            host: lookup("BROKER_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "BROKER_PORT", defaults.port)?,
            user: lookup("BROKER_USER").unwrap_or(defaults.user),
            password: lookup("BROKER_PASSWORD").unwrap_or(defaults.password),
            virtual_host: lookup("BROKER_VHOST").unwrap_or(defaults.virtual_host),
        })
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}{}",
            self.user, self.host, self.port, self.virtual_host
        )
    }
}

// The password never ends up in logs.
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("virtual_host", &self.virtual_host)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Process environment lookup, for use with the `from_lookup` constructors.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parse an optional variable, falling back to `default` when unset.
pub fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

/// A variable that must be present and non-empty.
pub fn required_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(key)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_local_guest() {
        let config = ConnectionConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(config, ConnectionConfig::default());
        assert_eq!(config.to_string(), "guest@localhost:5672/");
    }

    #[test]
    fn reads_overrides() {
        let config = ConnectionConfig::from_lookup(lookup_from(&[
            ("BROKER_HOST", "mq.internal"),
            ("BROKER_PORT", "5673"),
            ("BROKER_USER", "jobs"),
            ("BROKER_PASSWORD", "s3cret"),
            ("BROKER_VHOST", "/batch"),
        ]))
        .expect("overrides");

        assert_eq!(config.host, "mq.internal");
        assert_eq!(config.port, 5673);
        assert_eq!(config.user, "jobs");
        assert_eq!(config.virtual_host, "/batch");
    }

    #[test]
    fn invalid_port_is_rejected() {
        let result = ConnectionConfig::from_lookup(lookup_from(&[("BROKER_PORT", "amqp")]));
        assert_matches!(result, Err(ConfigError::Invalid { key: "BROKER_PORT", .. }));
    }

    #[test]
    fn debug_redacts_password() {
        let config = ConnectionConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn required_var_rejects_blank() {
        let lookup = lookup_from(&[("DISPATCH_QUEUE", "  ")]);
        assert_matches!(
            required_var(&lookup, "DISPATCH_QUEUE"),
            Err(ConfigError::Missing("DISPATCH_QUEUE"))
        );
    }
}
