// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use tokio::time::Instant;

/// Observable state of a [`CircuitBreaker`][super::CircuitBreaker].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the cool-down elapses.
    Open,
    /// A single trial call is in flight; everyone else is refused.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Point-in-time view of the breaker bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last reset or successful trial.
    pub failure_count: u32,
    /// When the most recent failure was recorded.
    pub last_failure_at: Option<Instant>,
    /// Successes recorded in a row while closed.
    pub consecutive_successes: u32,
}

/// Outcome of a state transition, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Transition {
    Unchanged,
    Opened,
    Probing,
    Closed,
    Reopened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { since: Instant },
}

#[derive(Debug)]
pub(super) struct State {
    phase: Phase,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    consecutive_successes: u32,
}

impl State {
    pub fn new() -> Self {
        Self {
            phase: Phase::Closed,
            failure_count: 0,
            last_failure_at: None,
            consecutive_successes: 0,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn circuit_state(&self) -> CircuitState {
        match self.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.circuit_state(),
            failure_count: self.failure_count,
            last_failure_at: self.last_failure_at,
            consecutive_successes: self.consecutive_successes,
        }
    }

    pub fn record_failure(&mut self, now: Instant, threshold: u32) -> Transition {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        self.consecutive_successes = 0;

        match self.phase {
            Phase::Closed if self.failure_count >= threshold => {
                self.phase = Phase::Open { since: now };
                Transition::Opened
            }
            Phase::HalfOpen { .. } => {
                self.phase = Phase::Open { since: now };
                Transition::Reopened
            }
            // failures while open restart the cool-down
            Phase::Open { .. } => {
                self.phase = Phase::Open { since: now };
                Transition::Unchanged
            }
            Phase::Closed => Transition::Unchanged,
        }
    }

    pub fn record_success(&mut self) -> Transition {
        match self.phase {
            Phase::HalfOpen { .. } => {
                self.phase = Phase::Closed;
                self.failure_count = 0;
                self.consecutive_successes = 1;
                Transition::Closed
            }
            Phase::Closed => {
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                Transition::Unchanged
            }
            // A call admitted before the circuit opened finished late; it says nothing
            // about the provider's current health.
            Phase::Open { .. } => Transition::Unchanged,
        }
    }

    pub fn try_acquire(&mut self, now: Instant, cooldown: Duration) -> (bool, Transition) {
        match self.phase {
            Phase::Closed => (true, Transition::Unchanged),
            Phase::Open { since } | Phase::HalfOpen { since } if now.saturating_duration_since(since) >= cooldown => {
                self.phase = Phase::HalfOpen { since: now };
                (true, Transition::Probing)
            }
            Phase::Open { .. } | Phase::HalfOpen { .. } => (false, Transition::Unchanged),
        }
    }

    pub fn retry_after(&self, now: Instant, cooldown: Duration) -> Option<Duration> {
        match self.phase {
            Phase::Closed => None,
            Phase::Open { since } | Phase::HalfOpen { since } => {
                Some(cooldown.saturating_sub(now.saturating_duration_since(since)))
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
