// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Circuit breaker guarding calls to the identity provider.
//!
//! The breaker counts consecutive provider failures. Once the count reaches the configured
//! threshold the circuit opens and [`CircuitBreaker::should_attempt`] answers `false`, giving
//! callers an instant "don't even try" signal. After the cool-down a single trial call is
//! let through; its outcome either closes the circuit or opens it again.
//!
//! ```text
//! Closed --(failures >= threshold)--> Open --(cooldown elapsed)--> HalfOpen --(trial success)--> Closed
//!                                       ^                              |
//!                                       +-------(trial failure)--------+
//! ```
//!
//! # Defaults
//!
//! | Parameter | Default Value | Configured By |
//! |-----------|---------------|---------------|
//! | Failure threshold | `3` | [`BreakerConfig::failure_threshold`] |
//! | Cool-down | `30` seconds | [`BreakerConfig::cooldown_ms`] |
//! | Base timeout | `5` seconds | [`BreakerConfig::base_timeout_ms`] |
//! | Max timeout | `15` seconds | [`BreakerConfig::max_timeout_ms`] |
//!
//! # Examples
//!
//! ```rust
//! use tenant_guard::breaker::{CircuitBreaker, CircuitState};
//! use tenant_guard::config::BreakerConfig;
//! use tenant_guard::ProviderError;
//!
//! let breaker = CircuitBreaker::new(BreakerConfig::default());
//! for _ in 0..3 {
//!     breaker.record_failure(&ProviderError::Network("connection reset".into()));
//! }
//!
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(!breaker.should_attempt());
//! ```

mod state;

use std::time::Duration;

use parking_lot::Mutex;
pub use state::{BreakerSnapshot, CircuitState};
use state::{State, Transition};
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::ProviderError;
use crate::telemetry;

/// Growth of the recommended timeout per recorded failure, in percent of the base timeout.
const TIMEOUT_GROWTH_PERCENT: u32 = 50;

/// Tracks provider health and gates new calls.
///
/// All methods take `&self`; the breaker is meant to be shared behind an `Arc` by every
/// component that talks to the provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: Mutex::new(State::new()),
            config,
        }
    }

    /// Records a failed provider call.
    ///
    /// Opens the circuit once the failure count reaches the threshold, and re-opens it when
    /// a trial call fails.
    pub fn record_failure(&self, error: &ProviderError) {
        // NOTE: time is read outside the lock.
        let now = Instant::now();
        let (transition, failures) = {
            let mut state = self.state.lock();
            let transition = state.record_failure(now, self.config.failure_threshold);
            (transition, state.failure_count())
        };

        tracing::event!(
            name: "tenant_guard.breaker.failure",
            tracing::Level::DEBUG,
            breaker.failure_count = failures,
            error = %error,
        );
        self.log_transition(transition, failures);
    }

    /// Records a successful provider call.
    ///
    /// A success during a trial closes the circuit and zeroes the failure count; a success
    /// while closed only updates the success streak.
    pub fn record_success(&self) {
        let (transition, failures) = {
            let mut state = self.state.lock();
            let transition = state.record_success();
            (transition, state.failure_count())
        };

        self.log_transition(transition, failures);
    }

    /// Returns `true` when a new provider call should be made.
    ///
    /// While open, exactly one caller is admitted once the cool-down has elapsed; that
    /// caller's call is the trial and every other caller is refused until its outcome is
    /// recorded. A trial that never reports back stops blocking after another cool-down.
    #[must_use]
    pub fn should_attempt(&self) -> bool {
        let now = Instant::now();
        let (allowed, transition, failures) = {
            let mut state = self.state.lock();
            let (allowed, transition) = state.try_acquire(now, self.config.cooldown());
            (allowed, transition, state.failure_count())
        };

        self.log_transition(transition, failures);
        allowed
    }

    /// Timeout to use for the next provider call.
    ///
    /// Grows by half of the base timeout for every recorded failure, capped at the
    /// configured maximum.
    #[must_use]
    pub fn recommended_timeout(&self) -> Duration {
        let failures = self.state.lock().failure_count();
        let base = self.config.base_timeout();
        let growth = base.saturating_mul(TIMEOUT_GROWTH_PERCENT).saturating_mul(failures) / 100;

        base.saturating_add(growth).min(self.config.max_timeout())
    }

    /// Forces the circuit closed and zeroes all counters.
    pub fn reset(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.circuit_state();
            state.reset();
            previous
        };

        tracing::event!(
            name: "tenant_guard.breaker.reset",
            tracing::Level::INFO,
            breaker.previous_state = %previous,
        );
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit_state()
    }

    /// Failures recorded since the last reset or successful trial.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count()
    }

    /// Full view of the breaker bookkeeping.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.state.lock().snapshot()
    }

    /// Time left until a trial call is allowed; `None` while closed.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let now = Instant::now();
        self.state.lock().retry_after(now, self.config.cooldown())
    }

    fn log_transition(&self, transition: Transition, failures: u32) {
        let (event, level) = match transition {
            Transition::Unchanged => return,
            Transition::Opened => ("opened", tracing::Level::WARN),
            Transition::Reopened => ("reopened", tracing::Level::WARN),
            Transition::Probing => ("probing", tracing::Level::INFO),
            Transition::Closed => ("closed", tracing::Level::INFO),
        };

        telemetry::breaker_transition(event, level, failures, self.config.failure_threshold);
    }
}
