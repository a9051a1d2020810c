// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::{CacheEntry, CacheStore};
use crate::config::CacheConfig;
use crate::error::CacheError;

const DEFAULT_MAX_ENTRIES: usize = 256;

/// In-memory [`CacheStore`] with a bounded number of entries.
///
/// Expired entries are evicted lazily when read. When a new key is inserted into a full
/// cache, expired entries are purged first and, if that is not enough, the entry closest to
/// expiry is dropped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tenant_guard::cache::{CacheStore, CacheStoreExt, MemoryCache};
///
/// let cache = MemoryCache::new();
/// cache.set_as("tenant.id", "3f6a1e2b-9c3d-4a11-8b2f-1234567890ab", Duration::from_secs(60)).unwrap();
///
/// let tenant: Option<String> = cache.get_as("tenant.id");
/// assert_eq!(tenant.as_deref(), Some("3f6a1e2b-9c3d-4a11-8b2f-1234567890ab"));
/// ```
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry<Value>>>,
    max_entries: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Creates a cache holding at most 256 entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Creates a cache holding at most `max_entries` entries (minimum one).
    #[must_use]
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Creates a cache sized by [`CacheConfig::max_entries`].
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::with_max_entries(config.max_entries)
    }

    /// Number of stored entries, including expired ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &str) -> Option<CacheEntry<Value>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = entries.get(key)?.is_expired(now);
        if expired {
            entries.remove(key);
            return None;
        }

        entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::ZeroTtl(key.to_string()));
        }

        let now = Instant::now();
        let entry = CacheEntry::new(value, now, ttl);
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, entry| !entry.is_expired(now));

            if entries.len() >= self.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at())
                    .map(|(key, _)| key.clone());

                if let Some(victim) = victim {
                    entries.remove(&victim);
                }
            }
        }

        entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::CacheStoreExt;

    #[tokio::test(start_paused = true)]
    async fn get_returns_live_entry() {
        let cache = MemoryCache::new();
        cache.set("k", json!("v"), Duration::from_secs(10)).unwrap();

        let entry = cache.get("k").unwrap();
        assert_eq!(entry.value(), &json!("v"));
        assert_eq!(entry.ttl(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_reads_as_none_and_is_evicted() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Duration::from_secs(10)).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_previous_value() {
        let cache = MemoryCache::new();
        cache.set_as("k", &1, Duration::from_secs(10)).unwrap();
        cache.set_as("k", &2, Duration::from_secs(10)).unwrap();

        assert_eq!(cache.get_as::<u32>("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let cache = MemoryCache::new();
        let err = cache.set("k", json!(1), Duration::ZERO).unwrap_err();

        assert!(matches!(err, CacheError::ZeroTtl(key) if key == "k"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_soonest_expiring_entry() {
        let cache = MemoryCache::with_max_entries(2);
        cache.set("short", json!(1), Duration::from_secs(5)).unwrap();
        cache.set("long", json!(2), Duration::from_secs(50)).unwrap();

        cache.set("new", json!(3), Duration::from_secs(20)).unwrap();

        assert!(cache.get("short").is_none());
        assert!(cache.get("long").is_some());
        assert!(cache.get("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_purging_expired_entries() {
        let cache = MemoryCache::with_max_entries(2);
        cache.set("a", json!(1), Duration::from_secs(1)).unwrap();
        cache.set("b", json!(2), Duration::from_secs(1)).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set("c", json!(3), Duration::from_secs(1)).unwrap();

        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_capacity_bounds_the_cache() {
        let mut config = CacheConfig::default();
        config.max_entries = 2;
        let cache = MemoryCache::from_config(&config);

        cache.set("a", json!(1), Duration::from_secs(5)).unwrap();
        cache.set("b", json!(2), Duration::from_secs(50)).unwrap();
        cache.set("c", json!(3), Duration::from_secs(50)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_ttl_is_capped_instead_of_overflowing() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), Duration::MAX).unwrap();

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;

        let entry = cache.get("k").unwrap();
        assert_eq!(entry.value(), &json!(1));
        assert!(entry.ttl() >= Duration::from_secs(86_400 * 365 * 30));
    }

    #[test]
    fn remove_and_clear() {
        let cache = MemoryCache::new();
        cache.set("a", json!(1), Duration::from_secs(1)).unwrap();
        cache.set("b", json!(2), Duration::from_secs(1)).unwrap();

        cache.remove("a");
        cache.remove("missing");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn mismatched_shape_reads_as_none() {
        let cache = MemoryCache::new();
        cache.set("k", json!({"not": "a number"}), Duration::from_secs(1)).unwrap();

        assert_eq!(cache.get_as::<u32>("k"), None);
    }
}
