// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Factor applied to the delay for every further retry.
const EXPONENTIAL_FACTOR: u32 = 2;

/// A single try inside a retry loop.
///
/// The index is 0-based: the first try is attempt `0`, the first retry is attempt `1`.
///
/// # Examples
///
/// ```
/// use tenant_guard::resilient::Attempt;
///
/// let attempt = Attempt::new(0, false);
/// assert!(attempt.is_first());
/// assert_eq!(attempt.number(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    index: u32,
    is_last: bool,
}

impl Attempt {
    /// Creates an attempt.
    #[must_use]
    pub fn new(index: u32, is_last: bool) -> Self {
        Self { index, is_last }
    }

    fn first(max_retries: u32) -> Self {
        Self::new(0, max_retries == 0)
    }

    /// Returns the next attempt, or `None` when the retries are used up.
    fn next(self, max_retries: u32) -> Option<Self> {
        if self.index >= max_retries {
            return None;
        }

        let index = self.index.saturating_add(1);
        Some(Self::new(index, index == max_retries))
    }

    /// 0-based index of the try.
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// 1-based count of tries made so far, including this one.
    #[must_use]
    pub fn number(self) -> u32 {
        self.index.saturating_add(1)
    }

    /// Returns `true` for the initial try.
    #[must_use]
    pub fn is_first(self) -> bool {
        self.index == 0
    }

    /// Returns `true` when no retry will follow this try.
    #[must_use]
    pub fn is_last(self) -> bool {
        self.is_last
    }
}

impl Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.index.fmt(f)
    }
}

/// Exponential backoff with a cap.
///
/// The delay before retry `n` (0-based, counted from the first failure) is
/// `min(2^n * base_delay, max_delay)`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tenant_guard::resilient::BackoffPolicy;
///
/// let policy = BackoffPolicy::new(3, Duration::from_millis(100), Duration::from_millis(300));
/// assert_eq!(policy.delay(0), Duration::from_millis(100));
/// assert_eq!(policy.delay(1), Duration::from_millis(200));
/// assert_eq!(policy.delay(2), Duration::from_millis(300));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl BackoffPolicy {
    /// Creates a policy allowing `max_retries` retries after the first try.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Retries allowed after the first try.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay to wait after the try with the given 0-based index failed.
    #[must_use]
    pub fn delay(&self, failed_index: u32) -> Duration {
        let factor = EXPONENTIAL_FACTOR.checked_pow(failed_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Upper bound for the total time spent in backoff delays.
    #[must_use]
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_retries).map(|index| self.delay(index)).fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every allowed try failed with a retryable error.
    Exhausted {
        /// The error of the last try.
        last: E,
        /// Tries made.
        attempts: u32,
    },
    /// A try failed with an error that must not be retried.
    Rejected {
        /// The rejecting error.
        error: E,
        /// Tries made.
        attempts: u32,
    },
    /// The cancellation token fired.
    Cancelled {
        /// Tries started before cancellation.
        attempts: u32,
    },
}

/// Runs `operation` until it succeeds, a non-retryable error occurs, the retries run out,
/// or `cancellation` fires.
///
/// Every try and every backoff delay races against the cancellation token; a cancelled
/// try is dropped at its next suspension point. `on_retry` is invoked right before each
/// backoff delay.
///
/// # Errors
///
/// Returns the [`RetryError`] describing why no success was produced.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tenant_guard::resilient::{BackoffPolicy, retry_with_backoff};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let policy = BackoffPolicy::new(2, Duration::from_millis(1), Duration::from_millis(5));
/// let result = retry_with_backoff(
///     &policy,
///     &CancellationToken::new(),
///     |attempt| async move { if attempt.index() < 2 { Err("busy") } else { Ok(attempt.index()) } },
///     |_error: &&str| true,
///     |_, _, _| {},
/// )
/// .await;
///
/// assert_eq!(result, Ok(2));
/// # }
/// ```
pub async fn retry_with_backoff<T, E, F, Fut, R, N>(
    policy: &BackoffPolicy,
    cancellation: &CancellationToken,
    mut operation: F,
    is_retryable: R,
    mut on_retry: N,
) -> Result<T, RetryError<E>>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    N: FnMut(&E, Attempt, Duration),
{
    let mut attempt = Attempt::first(policy.max_retries);

    loop {
        let outcome = tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(RetryError::Cancelled { attempts: attempt.index() }),
            outcome = operation(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable(&error) {
            return Err(RetryError::Rejected {
                error,
                attempts: attempt.number(),
            });
        }

        let Some(next) = attempt.next(policy.max_retries) else {
            return Err(RetryError::Exhausted {
                last: error,
                attempts: attempt.number(),
            });
        };

        let delay = policy.delay(attempt.index());
        on_retry(&error, attempt, delay);

        tokio::select! {
            biased;
            () = cancellation.cancelled() => return Err(RetryError::Cancelled { attempts: attempt.number() }),
            () = tokio::time::sleep(delay) => {}
        }

        attempt = next;
    }
}
