// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resilient execution of identity provider calls.
//!
//! [`ResilientCaller`] wraps a raw provider call with, in order:
//!
//! 1. **Memoization**: a successful result is reused for the memo TTL, and concurrent callers
//!    with the same operation key join the call already in flight.
//! 2. **Breaker gating**: when the [`CircuitBreaker`] refuses, the last-known-good value or a
//!    derived value is returned without touching the provider.
//! 3. **Timeout and retry**: every try is bounded by the breaker's recommended timeout and
//!    transient failures are retried with capped exponential backoff.
//! 4. **Fallback**: when the retries run out, the last-known-good value (or failing that, a
//!    derived value) is returned instead of the error.
//!
//! Definitive rejections ([`ProviderError::NotAuthorized`], [`ProviderError::UserNotFound`])
//! are surfaced immediately and are never retried.
//!
//! # Defaults
//!
//! | Parameter | Default Value | Configured By |
//! |-----------|---------------|---------------|
//! | Max retries | `3` | [`RetryConfig::max_retries`], [`CallOptions::max_retries`] |
//! | Base delay | `500` ms | [`RetryConfig::base_delay_ms`] |
//! | Max delay | `5` seconds | [`RetryConfig::max_delay_ms`] |
//! | Memo TTL | `60` seconds | [`RetryConfig::memo_ttl_ms`] |
//! | Fallback TTL | `10` minutes | [`RetryConfig::fallback_ttl_ms`] |

mod backoff;
mod memo;
mod options;

use std::borrow::Cow;
use std::sync::Arc;

pub use backoff::{Attempt, BackoffPolicy, RetryError, retry_with_backoff};
use futures_util::FutureExt;
use memo::{Lookup, MemoTable, MemoValue};
pub use options::CallOptions;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::breaker::CircuitBreaker;
use crate::cache::{CacheStore, CacheStoreExt, keys, store_best_effort};
use crate::config::RetryConfig;
use crate::error::{IdentityError, ProviderError};
use crate::telemetry;

/// Where a value returned by [`ResilientCaller`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ValueSource {
    /// Fetched from the provider by this call or by the in-flight call it joined.
    Provider,
    /// Reused from a recent provider result.
    Memoized,
    /// The last-known-good value, returned because the provider was unavailable.
    Cached,
    /// Built locally because the provider was unavailable and nothing was cached.
    Derived,
}

impl ValueSource {
    /// Returns `true` when the value reflects a provider response.
    #[must_use]
    pub fn is_authoritative(self) -> bool {
        matches!(self, Self::Provider | Self::Memoized)
    }
}

/// A value together with its [`ValueSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    /// The value.
    pub value: T,
    /// Where the value came from.
    pub source: ValueSource,
}

impl<T> Sourced<T> {
    /// Pairs `value` with its `source`.
    #[must_use]
    pub fn new(value: T, source: ValueSource) -> Self {
        Self { value, source }
    }

    /// Discards the source.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }
}

#[derive(Debug)]
struct Inner<C> {
    breaker: Arc<CircuitBreaker>,
    cache: Arc<C>,
    config: RetryConfig,
    memo: MemoTable,
}

/// Runs provider calls with memoization, breaker gating, timeouts, retries and fallbacks.
///
/// Cloning is cheap; clones share the memo table, the breaker and the cache.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tenant_guard::breaker::CircuitBreaker;
/// use tenant_guard::cache::MemoryCache;
/// use tenant_guard::config::{BreakerConfig, RetryConfig};
/// use tenant_guard::resilient::{CallOptions, ResilientCaller};
/// use tenant_guard::ProviderError;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let caller = ResilientCaller::new(
///     Arc::new(CircuitBreaker::new(BreakerConfig::default())),
///     Arc::new(MemoryCache::new()),
///     RetryConfig::default(),
/// );
///
/// let name = caller
///     .call("demo.name", &CallOptions::new(), || async { Ok::<_, ProviderError>("contoso".to_string()) })
///     .await
///     .unwrap();
/// assert_eq!(name, "contoso");
/// # }
/// ```
#[derive(Debug)]
pub struct ResilientCaller<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for ResilientCaller<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> ResilientCaller<C>
where
    C: CacheStore + 'static,
{
    /// Creates a caller sharing `breaker` and `cache` with the rest of the host.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, cache: Arc<C>, config: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                breaker,
                cache,
                config,
                memo: MemoTable::default(),
            }),
        }
    }

    /// The breaker gating every call.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    /// The cache holding last-known-good values.
    #[must_use]
    pub fn cache(&self) -> &C {
        &self.inner.cache
    }

    /// A shared handle to the cache.
    #[must_use]
    pub fn cache_arc(&self) -> Arc<C> {
        Arc::clone(&self.inner.cache)
    }

    /// The retry configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Drops the memoized result and the last-known-good value for `operation`.
    ///
    /// A call already in flight is not interrupted, but its result is no longer shared
    /// with callers arriving after this point.
    pub fn invalidate(&self, operation: &str) {
        self.inner.memo.invalidate(operation);
        self.inner.cache.remove(&keys::fallback(operation));
    }

    /// Runs `raw` resiliently under the `operation` key.
    ///
    /// # Errors
    ///
    /// See [`call_sourced`][Self::call_sourced].
    pub async fn call<T, F, Fut>(
        &self,
        operation: impl Into<Cow<'static, str>>,
        options: &CallOptions,
        raw: F,
    ) -> Result<T, IdentityError>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        self.call_sourced(operation, options, raw, || None).await.map(Sourced::into_value)
    }

    /// Runs `raw` resiliently under the `operation` key, using `derive` to build a minimal
    /// value when the circuit is open and no last-known-good value exists.
    ///
    /// # Errors
    ///
    /// See [`call_sourced`][Self::call_sourced].
    pub async fn call_or_derive<T, F, Fut, D>(
        &self,
        operation: impl Into<Cow<'static, str>>,
        options: &CallOptions,
        raw: F,
        derive: D,
    ) -> Result<T, IdentityError>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        D: Fn() -> Option<T> + Send + Sync + 'static,
    {
        self.call_sourced(operation, options, raw, derive).await.map(Sourced::into_value)
    }

    /// Like [`call_or_derive`][Self::call_or_derive], but also reports where the value came from.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::DefinitiveAuth`] when the provider rejected the call.
    /// - [`IdentityError::CircuitOpen`] when the breaker refused and no fallback exists.
    /// - [`IdentityError::Transient`] when every try failed and no fallback exists.
    /// - [`IdentityError::Cancelled`] when the options' cancellation token fired.
    pub async fn call_sourced<T, F, Fut, D>(
        &self,
        operation: impl Into<Cow<'static, str>>,
        options: &CallOptions,
        raw: F,
        derive: D,
    ) -> Result<Sourced<T>, IdentityError>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
        D: Fn() -> Option<T> + Send + Sync + 'static,
    {
        let operation = operation.into();
        if options.cancellation.is_cancelled() {
            return Err(IdentityError::Cancelled { operation });
        }

        if !options.use_memoized {
            return self.execute(operation, options, &raw, &derive).await;
        }

        let raw = Arc::new(raw);
        let derive = Arc::new(derive);
        let lookup = self
            .inner
            .memo
            .lookup_or_start(&operation, self.inner.config.memo_ttl(), Instant::now(), |generation| {
                let caller = self.clone();
                let operation = operation.clone();
                let options = options.clone();
                let raw = Arc::clone(&raw);
                let derive = Arc::clone(&derive);

                async move {
                    let outcome = caller.execute(operation.clone(), &options, raw.as_ref(), derive.as_ref()).await;
                    let memo = &caller.inner.memo;
                    match outcome {
                        Ok(Sourced { value, source }) => {
                            let value: MemoValue = Arc::new(value);
                            if source == ValueSource::Provider {
                                memo.complete(&operation, generation, &value, Instant::now());
                            } else {
                                memo.abandon(&operation, generation);
                            }
                            Ok((value, source))
                        }
                        Err(error) => {
                            memo.abandon(&operation, generation);
                            Err(error)
                        }
                    }
                }
                .boxed()
            });

        let (call, led) = match lookup {
            Lookup::Ready(value) => {
                if let Some(value) = downcast::<T>(&value) {
                    return Ok(Sourced::new(value, ValueSource::Memoized));
                }
                return self.unshared(operation, options, raw.as_ref(), derive.as_ref()).await;
            }
            Lookup::Join(call) => (call, None),
            Lookup::Lead { call, generation } => (call, Some(generation)),
        };

        let outcome = tokio::select! {
            biased;
            () = options.cancellation.cancelled() => {
                if let Some(generation) = led {
                    self.inner.memo.abandon(&operation, generation);
                }
                return Err(IdentityError::Cancelled { operation });
            }
            outcome = call => outcome,
        };

        match outcome {
            Ok((value, source)) => match downcast::<T>(&value) {
                Some(value) => Ok(Sourced::new(value, source)),
                None => self.unshared(operation, options, raw.as_ref(), derive.as_ref()).await,
            },
            // The leader went away while this caller is still interested.
            Err(IdentityError::Cancelled { .. }) if led.is_none() => {
                self.execute(operation, options, raw.as_ref(), derive.as_ref()).await
            }
            Err(error) => Err(error),
        }
    }

    async fn unshared<T, F, Fut, D>(
        &self,
        operation: Cow<'static, str>,
        options: &CallOptions,
        raw: &F,
        derive: &D,
    ) -> Result<Sourced<T>, IdentityError>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        D: Fn() -> Option<T> + Send + Sync,
    {
        tracing::debug!(operation = %operation, "memoized value has a different type, calling without memoization");
        self.execute(operation, options, raw, derive).await
    }

    async fn execute<T, F, Fut, D>(
        &self,
        operation: Cow<'static, str>,
        options: &CallOptions,
        raw: &F,
        derive: &D,
    ) -> Result<Sourced<T>, IdentityError>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ProviderError>> + Send,
        D: Fn() -> Option<T> + Send + Sync,
    {
        let started = Instant::now();
        let breaker = &self.inner.breaker;
        let cancellation = &options.cancellation;

        if cancellation.is_cancelled() {
            return Err(IdentityError::Cancelled { operation });
        }

        if !breaker.should_attempt() {
            if let Some(value) = self.degraded(&operation, derive, started) {
                return Ok(value);
            }

            tracing::event!(
                name: "tenant_guard.call.circuit_open",
                tracing::Level::WARN,
                operation = %operation,
                elapsed_ms = telemetry::millis(started.elapsed()),
            );
            return Err(IdentityError::CircuitOpen {
                operation,
                retry_after: breaker.retry_after(),
            });
        }

        let policy = BackoffPolicy::new(
            options.max_retries.unwrap_or(self.inner.config.max_retries),
            self.inner.config.base_delay(),
            self.inner.config.max_delay(),
        );

        let outcome = retry_with_backoff(
            &policy,
            cancellation,
            |_attempt| async move {
                let timeout = options.timeout_override.unwrap_or_else(|| breaker.recommended_timeout());
                let result = tokio::time::timeout(timeout, raw())
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(timeout)));

                if let Err(error) = &result
                    && error.is_transient()
                    && !cancellation.is_cancelled()
                {
                    breaker.record_failure(error);
                }
                result
            },
            ProviderError::is_transient,
            |error, attempt, delay| telemetry::call_retry(&operation, attempt.number(), started.elapsed(), delay, error),
        )
        .await;

        if cancellation.is_cancelled() {
            return Err(IdentityError::Cancelled { operation });
        }

        match outcome {
            Ok(value) => {
                if breaker.failure_count() > 0 {
                    breaker.reset();
                } else {
                    breaker.record_success();
                }
                store_best_effort(
                    self.inner.cache.as_ref(),
                    &keys::fallback(&operation),
                    &value,
                    self.inner.config.fallback_ttl(),
                );
                Ok(Sourced::new(value, ValueSource::Provider))
            }
            Err(RetryError::Rejected { error, attempts }) => {
                // A definitive answer still proves the provider is reachable.
                breaker.record_success();
                telemetry::call_failed(&operation, attempts, started.elapsed(), &error);
                Err(IdentityError::DefinitiveAuth { operation, source: error })
            }
            Err(RetryError::Exhausted { last, attempts }) => {
                telemetry::call_failed(&operation, attempts, started.elapsed(), &last);
                if options.fallback_to_cache
                    && let Some(value) = self.degraded(&operation, derive, started)
                {
                    return Ok(value);
                }
                Err(IdentityError::from_provider(operation, attempts, last))
            }
            Err(RetryError::Cancelled { .. }) => Err(IdentityError::Cancelled { operation }),
        }
    }

    /// Last-known-good value, else a derived value.
    fn degraded<T, D>(&self, operation: &str, derive: &D, started: Instant) -> Option<Sourced<T>>
    where
        T: DeserializeOwned,
        D: Fn() -> Option<T>,
    {
        if let Some(value) = self.inner.cache.get_as::<T>(&keys::fallback(operation)) {
            telemetry::call_fallback(operation, "cache", started.elapsed());
            return Some(Sourced::new(value, ValueSource::Cached));
        }

        let value = derive()?;
        telemetry::call_fallback(operation, "derived", started.elapsed());
        Some(Sourced::new(value, ValueSource::Derived))
    }
}

fn downcast<T: Clone + 'static>(value: &MemoValue) -> Option<T> {
    (**value).downcast_ref::<T>().cloned()
}
