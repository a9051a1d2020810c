// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bounded key-value cache shared by every component.
//!
//! [`CacheStore`] is the contract the rest of the crate depends on: a small TTL-keyed store
//! with last-writer-wins semantics per key and no durability guarantees. [`MemoryCache`] is
//! the in-process implementation; hosts can plug in any other store (for example one
//! mirrored into browser storage) by implementing the trait.
//!
//! Values are [`serde_json::Value`]s so that heterogeneous data (tenant ids, attribute maps,
//! sessions, counters) can share one store. [`CacheStoreExt`] adds typed accessors on top.

mod entry;
pub mod keys;
mod memory;

use std::time::Duration;

pub use entry::CacheEntry;
pub use memory::MemoryCache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::CacheError;

/// A TTL-keyed store for small values.
///
/// Implementations must never return an expired entry from [`get`][CacheStore::get] and
/// should evict it when they notice it. There is no ordering guarantee across keys and no
/// compare-and-swap: a concurrent writer may overwrite a key between a caller's read and
/// write.
pub trait CacheStore: Send + Sync {
    /// Returns the live entry for `key`, if any.
    fn get(&self, key: &str) -> Option<CacheEntry<Value>>;

    /// Stores `value` under `key` for `ttl`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ZeroTtl`] when `ttl` is zero.
    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError>;

    /// Removes the entry for `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str);

    /// Removes every entry.
    fn clear(&self);
}

/// Typed convenience methods for any [`CacheStore`].
pub trait CacheStoreExt: CacheStore {
    /// Reads and deserializes the value stored under `key`.
    ///
    /// Values that fail to deserialize are treated as absent.
    fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.get(key)?;
        match serde_json::from_value(entry.into_value()) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::debug!(cache.key = key, error = %error, "ignoring cache value with unexpected shape");
                None
            }
        }
    }

    /// Serializes and stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Serialize`] when `value` cannot be represented as JSON and
    /// [`CacheError::ZeroTtl`] when `ttl` is zero.
    fn set_as<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Serialize {
            key: key.to_string(),
            source,
        })?;
        self.set(key, value, ttl)
    }
}

impl<C: CacheStore + ?Sized> CacheStoreExt for C {}

impl<C: CacheStore + ?Sized> CacheStore for std::sync::Arc<C> {
    fn get(&self, key: &str) -> Option<CacheEntry<Value>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key);
    }

    fn clear(&self) {
        (**self).clear();
    }
}

/// Writes to the cache without failing the caller.
///
/// Cache writes in the identity layer are best-effort hints; a failed write is logged and
/// otherwise ignored.
pub(crate) fn store_best_effort<C, T>(cache: &C, key: &str, value: &T, ttl: Duration)
where
    C: CacheStore + ?Sized,
    T: Serialize + ?Sized,
{
    if let Err(error) = cache.set_as(key, value, ttl) {
        tracing::warn!(cache.key = key, error = %error, "failed to write cache entry");
    }
}
