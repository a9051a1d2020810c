// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Holder {
    generation: u64,
    since: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    holder: Option<Holder>,
    next_generation: u64,
}

/// An at-most-one-in-flight flag.
///
/// [`try_acquire`][Self::try_acquire] checks and sets the flag in one step, so two callers
/// racing for it never both win. The returned [`InFlightGuard`] clears the flag when dropped.
/// A holder that never lets go is overruled once the hard timeout has elapsed; its guard then
/// becomes inert.
#[derive(Debug)]
pub struct InFlightFlag {
    name: &'static str,
    hard_timeout: Duration,
    slot: Mutex<Slot>,
}

impl InFlightFlag {
    /// Creates a cleared flag.
    #[must_use]
    pub fn new(name: &'static str, hard_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            hard_timeout,
            slot: Mutex::new(Slot::default()),
        })
    }

    /// Sets the flag unless a live holder has it.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        let now = Instant::now();
        let mut slot = self.slot.lock();

        if let Some(holder) = slot.holder {
            let held_for = now.saturating_duration_since(holder.since);
            if held_for < self.hard_timeout {
                return None;
            }

            tracing::event!(
                name: "tenant_guard.recovery.flag_expired",
                tracing::Level::WARN,
                flag = self.name,
                held_ms = crate::telemetry::millis(held_for),
            );
        }

        let generation = slot.next_generation;
        slot.next_generation = generation.wrapping_add(1);
        slot.holder = Some(Holder { generation, since: now });

        Some(InFlightGuard {
            flag: Arc::clone(self),
            generation,
        })
    }

    /// Returns `true` while a live holder has the flag.
    #[must_use]
    pub fn is_held(&self) -> bool {
        let now = Instant::now();
        self.slot
            .lock()
            .holder
            .is_some_and(|holder| now.saturating_duration_since(holder.since) < self.hard_timeout)
    }

    fn release(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.holder.is_some_and(|holder| holder.generation == generation) {
            slot.holder = None;
        }
    }
}

/// Holds an [`InFlightFlag`]; clears it on drop.
#[derive(Debug)]
#[must_use = "the flag is cleared as soon as the guard is dropped"]
pub struct InFlightGuard {
    flag: Arc<InFlightFlag>,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.release(self.generation);
    }
}
