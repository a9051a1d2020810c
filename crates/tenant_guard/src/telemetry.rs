// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured log events emitted by the identity layer.
//!
//! All events go through [`tracing`]; the crate never installs a subscriber. Event names
//! are stable and prefixed with `tenant_guard.`:
//!
//! | Event | Level | Fields |
//! |-------|-------|--------|
//! | `tenant_guard.breaker.transition` | WARN/INFO | `breaker.transition`, `breaker.failure_count`, `breaker.threshold` |
//! | `tenant_guard.call.retry` | WARN | `operation`, `attempt`, `elapsed_ms`, `retry.delay_ms`, `error` |
//! | `tenant_guard.call.failed` | WARN | `operation`, `attempt`, `elapsed_ms`, `error` |
//! | `tenant_guard.call.fallback` | INFO | `operation`, `fallback`, `elapsed_ms` |
//! | `tenant_guard.call.circuit_open` | WARN | `operation`, `elapsed_ms` |
//! | `tenant_guard.resolve.resolved` | INFO | `tenant.source`, `elapsed_ms` |
//! | `tenant_guard.resolve.exhausted` | WARN | `elapsed_ms` |
//! | `tenant_guard.recovery.entered` | WARN | `recovery.reason`, `recovery.attempts` |
//! | `tenant_guard.recovery.redirected` | INFO | `destination` |
//! | `tenant_guard.recovery.emergency` | WARN | `destination` |
//! | `tenant_guard.recovery.network_changed` | INFO | `network.quality`, `network.kind` |
//! | `tenant_guard.recovery.flag_expired` | WARN | `flag`, `held_ms` |
//!
//! The orchestrator emits a few more `tenant_guard.recovery.*` events at DEBUG and INFO.

use std::time::Duration;

use tracing::Level;

/// Milliseconds as a `u64`, saturating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn breaker_transition(transition: &'static str, level: Level, failures: u32, threshold: u32) {
    if level == Level::WARN {
        tracing::event!(
            name: "tenant_guard.breaker.transition",
            Level::WARN,
            breaker.transition = transition,
            breaker.failure_count = failures,
            breaker.threshold = threshold,
        );
    } else {
        tracing::event!(
            name: "tenant_guard.breaker.transition",
            Level::INFO,
            breaker.transition = transition,
            breaker.failure_count = failures,
            breaker.threshold = threshold,
        );
    }
}

pub(crate) fn call_retry(operation: &str, attempt: u32, elapsed: Duration, delay: Duration, error: &dyn std::fmt::Display) {
    tracing::event!(
        name: "tenant_guard.call.retry",
        Level::WARN,
        operation,
        attempt,
        elapsed_ms = millis(elapsed),
        retry.delay_ms = millis(delay),
        error = %error,
    );
}

pub(crate) fn call_failed(operation: &str, attempt: u32, elapsed: Duration, error: &dyn std::fmt::Display) {
    tracing::event!(
        name: "tenant_guard.call.failed",
        Level::WARN,
        operation,
        attempt,
        elapsed_ms = millis(elapsed),
        error = %error,
    );
}

pub(crate) fn call_fallback(operation: &str, fallback: &'static str, elapsed: Duration) {
    tracing::event!(
        name: "tenant_guard.call.fallback",
        Level::INFO,
        operation,
        fallback,
        elapsed_ms = millis(elapsed),
    );
}
