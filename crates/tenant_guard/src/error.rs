// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::time::Duration;

/// A failure reported by the identity provider for a single call.
///
/// Only [`Timeout`][ProviderError::Timeout] and [`Network`][ProviderError::Network] are
/// transient; the remaining variants are definitive rejections that retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The call did not complete within the allotted time.
    #[error("identity provider call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The call failed at the transport level.
    #[error("identity provider network failure: {0}")]
    Network(String),

    /// The provider rejected the caller's credentials.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The provider does not know the user.
    #[error("user not found: {0}")]
    UserNotFound(String),
}

impl ProviderError {
    /// Returns `true` when retrying the call might succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }
}

/// Errors surfaced by the resilient identity layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum IdentityError {
    /// The provider kept failing transiently and no fallback was available.
    #[error("operation `{operation}` failed after {attempts} attempt(s): {source}")]
    Transient {
        /// The logical operation key.
        operation: Cow<'static, str>,
        /// Number of tries made before giving up.
        attempts: u32,
        /// The last provider failure.
        source: ProviderError,
    },

    /// The provider definitively rejected the call. Never retried.
    #[error("operation `{operation}` was rejected: {source}")]
    DefinitiveAuth {
        /// The logical operation key.
        operation: Cow<'static, str>,
        /// The rejection reported by the provider.
        source: ProviderError,
    },

    /// The circuit breaker refused the call and no degraded value was available.
    #[error("circuit open for operation `{operation}`")]
    CircuitOpen {
        /// The logical operation key.
        operation: Cow<'static, str>,
        /// Time left until the breaker allows a trial call, if known.
        retry_after: Option<Duration>,
    },

    /// Every identity resolution strategy came back empty.
    #[error("no tenant identifier could be resolved from any source")]
    ResolutionExhausted,

    /// The operation was abandoned because its owner went away.
    #[error("operation `{operation}` was cancelled")]
    Cancelled {
        /// The logical operation key.
        operation: Cow<'static, str>,
    },
}

impl IdentityError {
    /// Returns `true` for provider rejections that must not be retried.
    #[must_use]
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::DefinitiveAuth { .. })
    }

    /// Returns `true` when the UI should ask the user to sign in again.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::DefinitiveAuth { .. } | Self::ResolutionExhausted)
    }

    /// Returns `true` when the error was produced by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn from_provider(operation: Cow<'static, str>, attempts: u32, source: ProviderError) -> Self {
        if source.is_transient() {
            Self::Transient {
                operation,
                attempts,
                source,
            }
        } else {
            Self::DefinitiveAuth { operation, source }
        }
    }
}

/// Errors produced when writing to a [`CacheStore`][crate::cache::CacheStore].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// Entries must live for a non-zero duration.
    #[error("cache entry for `{0}` must have a non-zero ttl")]
    ZeroTtl(String),

    /// The value could not be converted into its stored representation.
    #[error("cache value for `{key}` could not be serialized")]
    Serialize {
        /// The key being written.
        key: String,
        /// The underlying serializer failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced while loading a [`GuardConfig`][crate::GuardConfig].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration document is not well-formed.
    #[error("configuration could not be parsed")]
    Parse(#[from] serde_json::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}
