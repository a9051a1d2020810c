// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ops::Deref;
use std::time::Duration;

use tokio::time::Instant;

/// Expiry used for lifetimes too long to represent as an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A cached value together with its lifetime.
///
/// An entry is created with a fixed time-to-live; `expires_at` is `created_at + ttl`.
/// Lifetimes that overflow the clock, such as [`Duration::MAX`], are capped at thirty years.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tenant_guard::cache::CacheEntry;
/// use tokio::time::Instant;
///
/// let now = Instant::now();
/// let entry = CacheEntry::new("tenant", now, Duration::from_secs(60));
///
/// assert_eq!(*entry.value(), "tenant");
/// assert_eq!(entry.ttl(), Duration::from_secs(60));
/// assert!(!entry.is_expired(now));
/// assert!(entry.is_expired(now + Duration::from_secs(60)));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    /// Creates an entry cached at `created_at` that lives for `ttl`.
    pub fn new(value: V, created_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            created_at,
            expires_at: created_at
                .checked_add(ttl)
                .or_else(|| created_at.checked_add(FAR_FUTURE))
                .unwrap_or(created_at),
        }
    }

    /// Returns the cached value.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consumes the entry and returns the value.
    #[must_use]
    pub fn into_value(self) -> V {
        self.value
    }

    /// When the entry was written.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the entry stops being readable.
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// The lifetime the entry was created with.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(self.created_at)
    }

    /// Age of the entry at `now`.
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Returns `true` once `now` reaches the expiry instant.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

impl<V> Deref for CacheEntry<V> {
    type Target = V;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
