// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Per-call options for [`ResilientCaller`][super::ResilientCaller].
///
/// The defaults memoize results, fall back to cached values on exhaustion, use the
/// configured retry count and the breaker's recommended timeout, and are never cancelled.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tenant_guard::resilient::CallOptions;
/// use tokio_util::sync::CancellationToken;
///
/// let options = CallOptions::new()
///     .max_retries(1)
///     .timeout(Duration::from_secs(2))
///     .memoized(false)
///     .cancellation(CancellationToken::new());
///
/// assert_eq!(options.max_retries, Some(1));
/// assert!(!options.use_memoized);
/// assert!(options.fallback_to_cache);
/// ```
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Retries after the first try; `None` uses the configured default.
    pub max_retries: Option<u32>,
    /// Fixed per-try timeout; `None` uses the breaker's recommended timeout.
    pub timeout_override: Option<Duration>,
    /// Return the last-known-good value when every try failed.
    pub fallback_to_cache: bool,
    /// Reuse a recent result for the same operation and join in-flight calls.
    pub use_memoized: bool,
    /// Cancels the call at its next suspension point.
    pub cancellation: CancellationToken,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            timeout_override: None,
            fallback_to_cache: true,
            use_memoized: true,
            cancellation: CancellationToken::new(),
        }
    }
}

impl CallOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries after the first try.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Uses a fixed per-try timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    /// Enables or disables the cached-value fallback on exhaustion.
    #[must_use]
    pub fn fallback_to_cache(mut self, enabled: bool) -> Self {
        self.fallback_to_cache = enabled;
        self
    }

    /// Enables or disables memoization and call coalescing.
    #[must_use]
    pub fn memoized(mut self, enabled: bool) -> Self {
        self.use_memoized = enabled;
        self
    }

    /// Ties the call to a cancellation token.
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}
