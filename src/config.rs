//! Queue configuration.
//!
//! Settings shared by every component that talks to the ordered store:
//! connection, key namespace, dead-letter retention, result retention,
//! lease grace and circuit breaker defaults.

use std::time::Duration;

use crate::error::ConfigError;
use crate::scheduler::{BreakerConfig, BreakerSettings};

/// Configuration for the queue manager and its collaborators.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix prepended to every store key.
    pub key_prefix: String,

    // Retention settings
    /// Dead-letter list length that triggers a trim.
    pub dead_letter_cap: usize,
    /// Number of most recent dead-letter entries kept after a trim.
    pub dead_letter_keep: usize,
    /// Retention window for stored task results.
    pub result_ttl: Duration,
    /// Extra record lifetime granted on top of a leased task's timeout.
    pub lease_grace: Duration,

    // Circuit breaker settings
    /// Defaults applied to every dependency without an override.
    pub breaker: BreakerSettings,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: String::new(),

            dead_letter_cap: 1000,
            dead_letter_keep: 500,
            result_ttl: Duration::from_secs(86_400), // 24 hours
            lease_grace: Duration::from_secs(60),

            breaker: BreakerSettings::default(),
        }
    }
}

impl QueueConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GENQUEUE_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `GENQUEUE_KEY_PREFIX`: Store key prefix (default: empty)
    /// - `GENQUEUE_DEAD_LETTER_CAP`: Dead-letter trim trigger (default: 1000)
    /// - `GENQUEUE_DEAD_LETTER_KEEP`: Entries kept after trim (default: 500)
    /// - `GENQUEUE_RESULT_TTL_SECS`: Result retention (default: 86400)
    /// - `GENQUEUE_LEASE_GRACE_SECS`: Lease grace period (default: 60)
    /// - `GENQUEUE_BREAKER_THRESHOLD`: Failures before opening (default: 5)
    /// - `GENQUEUE_BREAKER_TIMEOUT_SECS`: Open cool-down (default: 60)
    /// - `GENQUEUE_BREAKER_SUCCESS_THRESHOLD`: Half-open successes to close (default: 2)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("GENQUEUE_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("GENQUEUE_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Ok(val) = std::env::var("GENQUEUE_DEAD_LETTER_CAP") {
            config.dead_letter_cap = parse_env_value(&val, "GENQUEUE_DEAD_LETTER_CAP")?;
        }

        if let Ok(val) = std::env::var("GENQUEUE_DEAD_LETTER_KEEP") {
            config.dead_letter_keep = parse_env_value(&val, "GENQUEUE_DEAD_LETTER_KEEP")?;
        }

        if let Ok(val) = std::env::var("GENQUEUE_RESULT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "GENQUEUE_RESULT_TTL_SECS")?;
            config.result_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("GENQUEUE_LEASE_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "GENQUEUE_LEASE_GRACE_SECS")?;
            config.lease_grace = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("GENQUEUE_BREAKER_THRESHOLD") {
            config.breaker.threshold = parse_env_value(&val, "GENQUEUE_BREAKER_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("GENQUEUE_BREAKER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "GENQUEUE_BREAKER_TIMEOUT_SECS")?;
            config.breaker.timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("GENQUEUE_BREAKER_SUCCESS_THRESHOLD") {
            config.breaker.success_threshold =
                parse_env_value(&val, "GENQUEUE_BREAKER_SUCCESS_THRESHOLD")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.dead_letter_cap == 0 {
            return Err(ConfigError::ValidationFailed(
                "dead_letter_cap must be greater than 0".to_string(),
            ));
        }

        if self.dead_letter_keep == 0 || self.dead_letter_keep >= self.dead_letter_cap {
            return Err(ConfigError::ValidationFailed(
                "dead_letter_keep must be between 1 and dead_letter_cap - 1".to_string(),
            ));
        }

        if self.result_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "result_ttl must be greater than 0".to_string(),
            ));
        }

        if self.breaker.threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker threshold must be greater than 0".to_string(),
            ));
        }

        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker success_threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Circuit breaker configuration: the configured defaults plus the
    /// built-in per-dependency overrides.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::with_builtin_overrides(self.breaker.clone())
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Builder method to set dead-letter retention.
    pub fn with_dead_letter_limits(mut self, cap: usize, keep: usize) -> Self {
        self.dead_letter_cap = cap;
        self.dead_letter_keep = keep;
        self
    }

    /// Builder method to set result retention.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Builder method to set the lease grace period.
    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    /// Builder method to set circuit breaker defaults.
    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }
}

/// Parse an environment variable value into a type.
pub(crate) fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert!(config.key_prefix.is_empty());
        assert_eq!(config.dead_letter_cap, 1000);
        assert_eq!(config.dead_letter_keep, 500);
        assert_eq!(config.result_ttl, Duration::from_secs(86_400));
        assert_eq!(config.breaker.threshold, 5);
        assert_eq!(config.breaker.timeout, Duration::from_secs(60));
        assert_eq!(config.breaker.success_threshold, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new()
            .with_redis_url("redis://cache:6380")
            .with_key_prefix("staging:")
            .with_dead_letter_limits(100, 50)
            .with_result_ttl(Duration::from_secs(60))
            .with_lease_grace(Duration::from_secs(5));

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.key_prefix, "staging:");
        assert_eq!(config.dead_letter_cap, 100);
        assert_eq!(config.dead_letter_keep, 50);
        assert_eq!(config.result_ttl, Duration::from_secs(60));
        assert_eq!(config.lease_grace, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_keep_not_below_cap() {
        let result = QueueConfig::default()
            .with_dead_letter_limits(100, 100)
            .validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("dead_letter_keep"));
    }

    #[test]
    fn test_validation_empty_url() {
        let result = QueueConfig::default().with_redis_url("").validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("redis_url"));
    }

    #[test]
    fn test_validation_zero_breaker_threshold() {
        let breaker = BreakerSettings {
            threshold: 0,
            ..BreakerSettings::default()
        };
        let result = QueueConfig::default().with_breaker(breaker).validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("threshold"));
    }

    #[test]
    fn test_parse_env_value() {
        let value: usize = parse_env_value(" 42 ", "KEY").unwrap();
        assert_eq!(value, 42);

        let err = parse_env_value::<u64>("soon", "GENQUEUE_RESULT_TTL_SECS").unwrap_err();
        assert!(err.to_string().contains("GENQUEUE_RESULT_TTL_SECS"));
        assert!(err.to_string().contains("soon"));
    }
}
