//! Configuration types
//!
//! Base trait and common configuration structures.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::error::DirectoryResult;

/// Trait for directory driver configuration.
pub trait DirectoryConfig: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Validate the configuration.
    fn validate(&self) -> DirectoryResult<()>;

    /// Get credentials that must not be logged.
    ///
    /// Returns a list of (field_name, value) pairs for sensitive data.
    fn get_credentials(&self) -> Vec<(&'static str, String)>;

    /// Create a redacted version of this config (for logging/display).
    fn redacted(&self) -> Self;
}

/// Connection timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection timeout in seconds.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Per-operation timeout in seconds (0 = wait indefinitely).
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    60
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl ConnectionSettings {
    /// Create new connection settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn with_connection_timeout(mut self, secs: u64) -> Self {
        self.connection_timeout_secs = secs;
        self
    }

    /// Set the operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, secs: u64) -> Self {
        self.operation_timeout_secs = secs;
        self
    }

    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get operation timeout as Duration, if one is set.
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }
}

/// Settings for the in-process result cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether results are cached at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of cached results.
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_capacity() -> u64 {
    10_000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: default_max_capacity(),
        }
    }
}

impl CacheSettings {
    /// Settings with caching turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the maximum capacity.
    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: u64) -> Self {
        self.max_capacity = max_capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_settings_defaults() {
        let settings = ConnectionSettings::default();
        assert_eq!(settings.connection_timeout(), Duration::from_secs(30));
        assert_eq!(settings.operation_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(settings.with_operation_timeout(0).operation_timeout(), None);
    }

    #[test]
    fn test_connection_settings_serde_defaults() {
        let settings: ConnectionSettings =
            serde_json::from_str(r#"{"connection_timeout_secs": 5}"#).unwrap();
        assert_eq!(settings.connection_timeout_secs, 5);
        assert_eq!(settings.operation_timeout_secs, 60);
    }

    #[test]
    fn test_cache_settings() {
        let settings: CacheSettings = serde_json::from_str("{}").unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.max_capacity, 10_000);
        assert!(!CacheSettings::disabled().enabled);
    }
}
