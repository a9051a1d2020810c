// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration for every component of the identity layer.
//!
//! All durations are stored as milliseconds so configuration documents stay plain JSON.
//! Missing fields fall back to the defaults documented on each field.
//!
//! ```rust
//! use std::time::Duration;
//! use tenant_guard::GuardConfig;
//!
//! let config = GuardConfig::from_json(r#"{ "breaker": { "failure_threshold": 5 } }"#).unwrap();
//! assert_eq!(config.breaker.failure_threshold, 5);
//! assert_eq!(config.breaker.cooldown(), Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct GuardConfig {
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Retry, timeout and memoization settings for the resilient wrapper.
    pub retry: RetryConfig,
    /// Cache sizing and lifetimes.
    pub cache: CacheConfig,
    /// Identity resolution settings.
    pub resolver: ResolverConfig,
    /// Recovery orchestration settings.
    pub recovery: RecoveryConfig,
}

impl GuardConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and [`ConfigError::Invalid`] when a
    /// value is out of range.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_zero(value: u64, field: &'static str) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
            Ok(())
        }

        non_zero(u64::from(self.breaker.failure_threshold), "breaker.failure_threshold")?;
        non_zero(self.breaker.base_timeout_ms, "breaker.base_timeout_ms")?;
        non_zero(self.retry.memo_ttl_ms, "retry.memo_ttl_ms")?;
        non_zero(self.retry.fallback_ttl_ms, "retry.fallback_ttl_ms")?;
        non_zero(self.cache.tenant_ttl_ms, "cache.tenant_ttl_ms")?;
        non_zero(self.cache.attempts_ttl_ms, "cache.attempts_ttl_ms")?;
        non_zero(u64::try_from(self.cache.max_entries).unwrap_or(u64::MAX), "cache.max_entries")?;
        non_zero(u64::from(self.recovery.attempt_threshold), "recovery.attempt_threshold")?;

        if self.breaker.max_timeout_ms < self.breaker.base_timeout_ms {
            return Err(ConfigError::Invalid {
                field: "breaker.max_timeout_ms",
                reason: "must not be smaller than breaker.base_timeout_ms",
            });
        }

        if !self.recovery.redirect_template.contains(TENANT_PLACEHOLDER) {
            return Err(ConfigError::Invalid {
                field: "recovery.redirect_template",
                reason: "must contain the {tenant_id} placeholder",
            });
        }

        Ok(())
    }
}

/// Placeholder substituted with the tenant id in [`RecoveryConfig::redirect_template`].
pub const TENANT_PLACEHOLDER: &str = "{tenant_id}";

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit. Default `3`.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call. Default `30_000`.
    pub cooldown_ms: u64,
    /// Timeout recommended for a healthy provider. Default `5_000`.
    pub base_timeout_ms: u64,
    /// Upper bound for the recommended timeout. Default `15_000`.
    pub max_timeout_ms: u64,
}

impl BreakerConfig {
    /// Cool-down as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Base timeout as a [`Duration`].
    #[must_use]
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    /// Timeout cap as a [`Duration`].
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 30_000,
            base_timeout_ms: 5_000,
            max_timeout_ms: 15_000,
        }
    }
}

/// Retry, timeout and memoization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RetryConfig {
    /// Retries after the first try. Default `3`.
    pub max_retries: u32,
    /// Base delay of the exponential backoff. Default `500`.
    pub base_delay_ms: u64,
    /// Cap applied to every backoff delay. Default `5_000`.
    pub max_delay_ms: u64,
    /// Lifetime of memoized results. Default `60_000`.
    pub memo_ttl_ms: u64,
    /// Lifetime of the last-known-good values used as fallback. Default `600_000`.
    pub fallback_ttl_ms: u64,
}

impl RetryConfig {
    /// Backoff base delay as a [`Duration`].
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap as a [`Duration`].
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Memoization lifetime as a [`Duration`].
    #[must_use]
    pub fn memo_ttl(&self) -> Duration {
        Duration::from_millis(self.memo_ttl_ms)
    }

    /// Fallback value lifetime as a [`Duration`].
    #[must_use]
    pub fn fallback_ttl(&self) -> Duration {
        Duration::from_millis(self.fallback_ttl_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            memo_ttl_ms: 60_000,
            fallback_ttl_ms: 600_000,
        }
    }
}

/// Cache sizing and lifetimes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct CacheConfig {
    /// Maximum number of entries kept by a cache built with
    /// [`MemoryCache::from_config`][crate::cache::MemoryCache::from_config]. Default `256`.
    pub max_entries: usize,
    /// Lifetime of persisted tenant identifiers. Default one day.
    pub tenant_ttl_ms: u64,
    /// Lifetime of the persisted recovery attempt counter. Default one hour.
    pub attempts_ttl_ms: u64,
}

impl CacheConfig {
    /// Tenant id lifetime as a [`Duration`].
    #[must_use]
    pub fn tenant_ttl(&self) -> Duration {
        Duration::from_millis(self.tenant_ttl_ms)
    }

    /// Attempt counter lifetime as a [`Duration`].
    #[must_use]
    pub fn attempts_ttl(&self) -> Duration {
        Duration::from_millis(self.attempts_ttl_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            tenant_ttl_ms: 86_400_000,
            attempts_ttl_ms: 3_600_000,
        }
    }
}

/// Identity resolution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct ResolverConfig {
    /// Provider attribute holding the tenant id. Default `custom:tenantId`.
    pub tenant_attribute: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            tenant_attribute: "custom:tenantId".to_string(),
        }
    }
}

/// Recovery orchestration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RecoveryConfig {
    /// Persisted provider failures that force recovery mode. Default `3`.
    pub attempt_threshold: u32,
    /// Minimum spacing between recovery checks. Default `10_000`.
    pub cooldown_ms: u64,
    /// Window that collapses bursts of network events. Default `300`.
    pub network_debounce_ms: u64,
    /// Safety net that clears the redirect flag. Default `5_000`.
    pub redirect_reset_ms: u64,
    /// Hard timeout after which a stuck recovery check flag is ignored. Default `30_000`.
    pub check_timeout_ms: u64,
    /// Whether automatic checks may navigate. Default `true`.
    pub auto_redirect: bool,
    /// Recovery destination, `{tenant_id}` is substituted. Default `/{tenant_id}/dashboard`.
    pub redirect_template: String,
    /// Destination used by emergency recovery. Default `/login`.
    pub emergency_path: String,
}

impl RecoveryConfig {
    /// Check cool-down as a [`Duration`].
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Network debounce window as a [`Duration`].
    #[must_use]
    pub fn network_debounce(&self) -> Duration {
        Duration::from_millis(self.network_debounce_ms)
    }

    /// Redirect flag safety net as a [`Duration`].
    #[must_use]
    pub fn redirect_reset(&self) -> Duration {
        Duration::from_millis(self.redirect_reset_ms)
    }

    /// Recovery check hard timeout as a [`Duration`].
    #[must_use]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    /// Renders the redirect destination for `tenant_id`.
    #[must_use]
    pub fn destination_for(&self, tenant_id: &str) -> String {
        self.redirect_template.replace(TENANT_PLACEHOLDER, tenant_id)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempt_threshold: 3,
            cooldown_ms: 10_000,
            network_debounce_ms: 300,
            redirect_reset_ms: 5_000,
            check_timeout_ms: 30_000,
            auto_redirect: true,
            redirect_template: "/{tenant_id}/dashboard".to_string(),
            emergency_path: "/login".to_string(),
        }
    }
}
