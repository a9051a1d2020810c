// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::ValueSource;
use crate::error::IdentityError;

pub(crate) type MemoValue = Arc<dyn Any + Send + Sync>;
pub(crate) type MemoOutcome = Result<(MemoValue, ValueSource), IdentityError>;
pub(crate) type PendingCall = BoxFuture<'static, MemoOutcome>;
pub(crate) type SharedCall = Shared<PendingCall>;

/// What a memoized caller should do next.
pub(crate) enum Lookup {
    /// A fresh result exists.
    Ready(MemoValue),
    /// Another caller is already running the operation.
    Join(SharedCall),
    /// This caller started the operation under the given generation.
    Lead { call: SharedCall, generation: u64 },
}

enum Slot {
    Ready { value: MemoValue, at: Instant },
    InFlight { call: SharedCall, generation: u64 },
}

/// Per-operation memoization with in-flight coalescing.
///
/// At most one call per key is in flight; later callers join it. Values fetched from the
/// provider are kept for the memo TTL; failures and degraded values are not memoized.
#[derive(Default)]
pub(crate) struct MemoTable {
    slots: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
}

impl Debug for MemoTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoTable")
            .field("keys", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}

impl MemoTable {
    /// Returns a fresh value or the in-flight call for `key`; otherwise builds the call
    /// with `start` and registers it, all under one lock.
    ///
    /// `start` receives the generation the call must report with in
    /// [`complete`][Self::complete]. It only builds the future; nothing is polled here.
    pub fn lookup_or_start(&self, key: &str, ttl: Duration, now: Instant, start: impl FnOnce(u64) -> PendingCall) -> Lookup {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready { value, at }) if now.saturating_duration_since(*at) < ttl => {
                return Lookup::Ready(Arc::clone(value));
            }
            Some(Slot::InFlight { call, .. }) => return Lookup::Join(call.clone()),
            Some(Slot::Ready { .. }) | None => {}
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let call = start(generation).shared();
        slots.insert(
            key.to_string(),
            Slot::InFlight {
                call: call.clone(),
                generation,
            },
        );

        Lookup::Lead { call, generation }
    }

    /// Memoizes `value` as the result of the call started under `generation`.
    ///
    /// Results of superseded generations are dropped.
    pub fn complete(&self, key: &str, generation: u64, value: &MemoValue, now: Instant) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::InFlight { generation: g, .. }) if *g == generation) {
            slots.insert(
                key.to_string(),
                Slot::Ready {
                    value: Arc::clone(value),
                    at: now,
                },
            );
        }
    }

    /// Drops the in-flight call started under `generation`, if it is still current.
    pub fn abandon(&self, key: &str, generation: u64) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(key), Some(Slot::InFlight { generation: g, .. }) if *g == generation) {
            slots.remove(key);
        }
    }

    /// Forgets everything known about `key`.
    pub fn invalidate(&self, key: &str) {
        self.slots.lock().remove(key);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn value(v: u32) -> MemoValue {
        Arc::new(v)
    }

    fn lead(table: &MemoTable, now: Instant, outcome: MemoOutcome) -> (u64, SharedCall) {
        match table.lookup_or_start("k", TTL, now, |_| async move { outcome }.boxed()) {
            Lookup::Lead { call, generation } => (generation, call),
            _ => panic!("expected to lead"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_call_is_joined_and_result_memoized() {
        let table = MemoTable::default();
        let now = Instant::now();
        let (generation, call) = lead(&table, now, Ok((value(7), ValueSource::Provider)));

        let joined = table.lookup_or_start("k", TTL, now, |_| panic!("must join"));
        assert!(matches!(joined, Lookup::Join(_)));

        let (fetched, _) = call.await.unwrap();
        table.complete("k", generation, &fetched, now);

        let Lookup::Ready(ready) = table.lookup_or_start("k", TTL, now, |_| panic!("must be memoized")) else {
            panic!("expected memoized value");
        };
        assert_eq!(ready.downcast_ref::<u32>(), Some(&7));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_value_requires_new_leader() {
        let table = MemoTable::default();
        let now = Instant::now();
        let (generation, _call) = lead(&table, now, Ok((value(1), ValueSource::Provider)));
        table.complete("k", generation, &value(1), now);

        let (next, _call) = lead(&table, now + TTL, Ok((value(2), ValueSource::Provider)));
        assert_ne!(next, generation);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_call_frees_the_key() {
        let table = MemoTable::default();
        let now = Instant::now();
        let (generation, _call) = lead(&table, now, Err(IdentityError::ResolutionExhausted));

        table.abandon("k", generation);

        let _ = lead(&table, now, Ok((value(2), ValueSource::Provider)));
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_generation_is_ignored() {
        let table = MemoTable::default();
        let now = Instant::now();
        let (old, _old_call) = lead(&table, now, Ok((value(1), ValueSource::Provider)));
        table.invalidate("k");
        let (_new, _new_call) = lead(&table, now, Ok((value(2), ValueSource::Provider)));

        table.complete("k", old, &value(1), now);
        table.abandon("k", old);

        let joined = table.lookup_or_start("k", TTL, now, |_| panic!("must join"));
        assert!(matches!(joined, Lookup::Join(_)));
    }
}
