use std::fmt;

/// A value could not be encoded to, or decoded from, a message body.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Failed to encode {what}: {message}")]
    Encode { what: &'static str, message: String },

    #[error("Failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },
}

/// Configuration could not be read from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0} must be set")]
    Missing(&'static str),

    #[error("Invalid configuration for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Failures collected while tearing down broker resources.
///
/// Cleanup runs every step even when an earlier one fails, so the
/// individual failures are gathered here and reported together.
#[derive(Debug, Default, thiserror::Error)]
#[error("{}", .failures.join("\n"))]
pub struct CleanupError {
    pub failures: Vec<String>,
}

impl CleanupError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed cleanup step.
    pub fn push(&mut self, step: impl fmt::Display, error: impl fmt::Display) {
        self.failures.push(format!("{step}: {error}"));
    }

    /// Merge the failures of another cleanup run into this one.
    pub fn extend(&mut self, other: CleanupError) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when no step failed, the combined error otherwise.
    pub fn into_result(self) -> Result<(), CleanupError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_serialization_errors() {
        let err = SerializationError::Decode {
            what: "envelope",
            message: "expected value at line 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to decode envelope: expected value at line 1"
        );
    }

    #[test]
    fn cleanup_without_failures_is_ok() {
        assert!(CleanupError::new().into_result().is_ok());
    }

    #[test]
    fn cleanup_joins_failures_with_newlines() {
        let mut errors = CleanupError::new();
        errors.push("purge queue 'work'", "channel closed");
        errors.push("delete queue 'cb-1'", "not found");

        let err = errors.into_result().expect_err("two steps failed");
        assert_eq!(
            err.to_string(),
            "purge queue 'work': channel closed\ndelete queue 'cb-1': not found"
        );
    }

    #[test]
    fn cleanup_extend_keeps_order() {
        let mut first = CleanupError::new();
        first.push("a", "1");
        let mut second = CleanupError::new();
        second.push("b", "2");

        first.extend(second);
        assert_eq!(first.failures, vec!["a: 1".to_string(), "b: 2".to_string()]);
    }
}
