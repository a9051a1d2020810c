// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Recovery orchestration.
//!
//! [`RecoveryOrchestrator`] watches for signs that identity is unhealthy, switches into
//! recovery mode, resolves a usable tenant id and redirects to the tenant's landing page.
//!
//! Recovery mode is entered when any of these holds:
//!
//! - the persisted failed-attempt counter reached the threshold,
//! - an explicit "provider unreliable" signal is pending,
//! - the circuit breaker is open,
//! - the network feed reports the host as offline.
//!
//! Checks are rate limited by a cool-down and at most one runs at a time. Bursts of network
//! events are debounced into one check. At most one redirect is in flight: its flag is held
//! until a safety-net timer fires, so neither a concurrent check nor
//! [`emergency_recover`][RecoveryOrchestrator::emergency_recover] can navigate twice.
//!
//! Everything runs on the Tokio runtime. [`mount`][RecoveryOrchestrator::mount] spawns the
//! network watcher; [`unmount`][RecoveryOrchestrator::unmount] cancels it together with every
//! pending timer and makes in-flight checks finish without touching state.
//!
//! # Defaults
//!
//! | Parameter | Default Value | Configured By |
//! |-----------|---------------|---------------|
//! | Attempt threshold | `3` | [`RecoveryConfig::attempt_threshold`] |
//! | Check cool-down | `10` seconds | [`RecoveryConfig::cooldown_ms`] |
//! | Network debounce | `300` ms | [`RecoveryConfig::network_debounce_ms`] |
//! | Redirect safety net | `5` seconds | [`RecoveryConfig::redirect_reset_ms`] |
//! | Check hard timeout | `30` seconds | [`RecoveryConfig::check_timeout_ms`] |

mod guard;
mod navigation;
mod network;
mod state;

use std::sync::Arc;
use std::time::Duration;

pub use guard::{InFlightFlag, InFlightGuard};
pub use navigation::Navigator;
pub use network::{NetworkEvent, NetworkFeed, NetworkStatus};
use parking_lot::Mutex;
pub use state::{RecoveryOutcome, RecoveryPhase, RecoveryState, RedirectOutcome};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cache::{CacheStore, CacheStoreExt, keys, store_best_effort};
use crate::config::{GuardConfig, RecoveryConfig};
use crate::provider::IdentityProvider;
use crate::resolve::IdentityResolver;

/// The redirect flag outlives its safety-net timer by this factor before it is overruled.
const REDIRECT_HARD_TIMEOUT_FACTOR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Automatic,
    Manual,
}

#[derive(Debug)]
struct Inner<P, C, N> {
    resolver: Arc<IdentityResolver<P, C, N>>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<C>,
    navigator: Arc<N>,
    network: NetworkFeed,
    config: RecoveryConfig,
    attempts_ttl: Duration,
    state: watch::Sender<RecoveryState>,
    check_flag: Arc<InFlightFlag>,
    redirect_flag: Arc<InFlightFlag>,
    last_check: Mutex<Option<Instant>>,
    mount: Mutex<Option<CancellationToken>>,
}

/// Drives the recovery state machine.
///
/// Cloning is cheap; clones drive the same state machine.
#[derive(Debug)]
pub struct RecoveryOrchestrator<P, C, N> {
    inner: Arc<Inner<P, C, N>>,
}

impl<P, C, N> Clone for RecoveryOrchestrator<P, C, N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, C, N> RecoveryOrchestrator<P, C, N>
where
    P: IdentityProvider,
    C: CacheStore + 'static,
    N: Navigator,
{
    /// Creates an unmounted orchestrator.
    ///
    /// The breaker, cache and navigator are the ones `resolver` uses.
    #[must_use]
    pub fn new(resolver: Arc<IdentityResolver<P, C, N>>, network: NetworkFeed, config: &GuardConfig) -> Self {
        let caller = resolver.identity().caller();
        let recovery = config.recovery.clone();
        let redirect_hard_timeout = recovery.redirect_reset().saturating_mul(REDIRECT_HARD_TIMEOUT_FACTOR);

        Self {
            inner: Arc::new(Inner {
                breaker: Arc::clone(caller.breaker()),
                cache: caller.cache_arc(),
                navigator: Arc::clone(resolver.navigator()),
                resolver,
                network,
                attempts_ttl: config.cache.attempts_ttl(),
                state: watch::Sender::new(RecoveryState::default()),
                check_flag: InFlightFlag::new("recovery.check", recovery.check_timeout()),
                redirect_flag: InFlightFlag::new("recovery.redirect", redirect_hard_timeout),
                config: recovery,
                last_check: Mutex::new(None),
                mount: Mutex::new(None),
            }),
        }
    }

    /// Starts watching the network feed and runs the first check.
    ///
    /// Mounting an already mounted orchestrator only runs a check.
    pub async fn mount(&self) -> RecoveryOutcome {
        let token = {
            let mut mount = self.inner.mount.lock();
            if mount.is_some() {
                None
            } else {
                let token = CancellationToken::new();
                *mount = Some(token.clone());
                Some(token)
            }
        };

        if let Some(token) = token {
            let attempts = self.attempts();
            self.inner.state.send_modify(|state| {
                state.mounted = true;
                state.attempts = attempts;
            });
            let events = self.inner.network.subscribe();
            tokio::spawn(self.clone().watch_network(events, token));
            tracing::event!(name: "tenant_guard.recovery.mounted", tracing::Level::DEBUG, "recovery mounted");
        }

        self.check_recovery().await
    }

    /// Stops the network watcher, cancels pending timers and in-flight checks, and resets
    /// the observable state.
    ///
    /// The persisted failed-attempt counter is kept.
    pub fn unmount(&self) {
        let Some(token) = self.inner.mount.lock().take() else {
            return;
        };

        self.inner.state.send_modify(|state| {
            token.cancel();
            *state = RecoveryState::default();
        });
        *self.inner.last_check.lock() = None;
        tracing::event!(name: "tenant_guard.recovery.unmounted", tracing::Level::DEBUG, "recovery unmounted");
    }

    /// Returns `true` while mounted.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.mount.lock().is_some()
    }

    /// Counts a failed identity attempt in the persisted counter and returns the new count.
    pub fn record_provider_failure(&self) -> u32 {
        let attempts = self.attempts().saturating_add(1);
        store_best_effort(self.inner.cache.as_ref(), keys::RECOVERY_ATTEMPTS, &attempts, self.inner.attempts_ttl);
        if let Some(token) = self.mount_token() {
            self.update(&token, |state| state.attempts = attempts);
        }

        tracing::event!(
            name: "tenant_guard.recovery.attempt_failed",
            tracing::Level::INFO,
            recovery.attempts = attempts,
            recovery.threshold = self.inner.config.attempt_threshold,
        );
        attempts
    }

    /// The persisted failed-attempt counter.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.cache.get_as::<u32>(keys::RECOVERY_ATTEMPTS).unwrap_or(0)
    }

    /// Marks the provider as unreliable; the next check enters recovery mode.
    pub fn signal_provider_unreliable(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            let changed = !state.provider_unreliable;
            state.provider_unreliable = true;
            changed
        });

        if changed {
            tracing::event!(
                name: "tenant_guard.recovery.provider_unreliable",
                tracing::Level::WARN,
                "identity provider marked unreliable"
            );
        }
    }

    /// Runs an automatic recovery check.
    ///
    /// Redirects only when automatic redirects are enabled.
    pub async fn check_recovery(&self) -> RecoveryOutcome {
        self.evaluate(Trigger::Automatic).await
    }

    /// Runs a user-initiated recovery: enters recovery mode and redirects even when
    /// automatic redirects are disabled.
    ///
    /// The cool-down and the in-flight guards still apply.
    pub async fn trigger_recovery(&self) -> RecoveryOutcome {
        self.evaluate(Trigger::Manual).await
    }

    /// Navigates straight to the emergency path.
    ///
    /// Skips identity resolution, the cool-down and the location check, but never issues a
    /// second navigation while another redirect is in flight. While unmounted it only
    /// navigates and leaves the observable state alone.
    pub fn emergency_recover(&self) -> RedirectOutcome {
        let token = self.mount_token();
        tracing::event!(
            name: "tenant_guard.recovery.emergency",
            tracing::Level::WARN,
            destination = %self.inner.config.emergency_path,
        );

        self.redirect(self.inner.config.emergency_path.clone(), token.as_ref(), false)
    }

    /// Leaves recovery: clears the attempt counter, the unreliable signal and the
    /// persisted activation marker, and closes the circuit breaker.
    pub fn complete_recovery(&self) {
        self.inner.cache.remove(keys::RECOVERY_ATTEMPTS);
        self.inner.cache.remove(keys::RECOVERY_ACTIVATED);
        self.inner.state.send_if_modified(|state| {
            let changed = state.phase != RecoveryPhase::Normal || state.provider_unreliable || state.attempts > 0;
            state.phase = RecoveryPhase::Normal;
            state.provider_unreliable = false;
            state.attempts = 0;
            changed
        });
        self.inner.breaker.reset();

        tracing::event!(name: "tenant_guard.recovery.completed", tracing::Level::INFO, "recovery completed");
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> RecoveryState {
        self.inner.state.borrow().clone()
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> RecoveryPhase {
        self.inner.state.borrow().phase
    }

    /// Observes every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.inner.state.subscribe()
    }

    fn mount_token(&self) -> Option<CancellationToken> {
        self.inner.mount.lock().clone()
    }

    /// Applies `change` unless `token` was cancelled; returns whether the state changed.
    fn update(&self, token: &CancellationToken, change: impl FnOnce(&mut RecoveryState)) -> bool {
        self.inner.state.send_if_modified(|state| {
            if token.is_cancelled() {
                return false;
            }

            let before = state.clone();
            change(state);
            *state != before
        })
    }

    async fn evaluate(&self, trigger: Trigger) -> RecoveryOutcome {
        let Some(token) = self.mount_token() else {
            return RecoveryOutcome::NotMounted;
        };

        let now = Instant::now();
        let cooldown = self.inner.config.cooldown();
        let _check = {
            let mut last_check = self.inner.last_check.lock();
            if let Some(at) = *last_check {
                let elapsed = now.saturating_duration_since(at);
                if elapsed < cooldown {
                    return RecoveryOutcome::CoolingDown {
                        retry_after: cooldown.saturating_sub(elapsed),
                    };
                }
            }

            let Some(guard) = self.inner.check_flag.try_acquire() else {
                return RecoveryOutcome::CheckInFlight;
            };
            *last_check = Some(now);
            guard
        };
        self.update(&token, |state| {
            state.last_check_at = Some(now);
            state.is_loading = true;
        });

        let outcome = self.run_check(trigger, &token).await;
        self.update(&token, |state| state.is_loading = false);
        outcome
    }

    async fn run_check(&self, trigger: Trigger, token: &CancellationToken) -> RecoveryOutcome {
        let reason = match trigger {
            Trigger::Manual => Some("manual"),
            Trigger::Automatic => self.recovery_reason(),
        };
        let Some(reason) = reason else {
            return RecoveryOutcome::Healthy;
        };

        self.enter_recovery_mode(token, reason);

        let tenant_id = match self.inner.resolver.resolve(token).await {
            Ok(resolved) => Some(resolved.tenant_id),
            Err(error) if error.is_cancelled() => return RecoveryOutcome::Cancelled,
            Err(error) => {
                tracing::event!(
                    name: "tenant_guard.recovery.unresolved",
                    tracing::Level::WARN,
                    error = %error,
                );
                None
            }
        };

        if token.is_cancelled() {
            return RecoveryOutcome::Cancelled;
        }
        self.update(token, |state| state.recovered_tenant = tenant_id);
        if let Some(tenant_id) = tenant_id {
            store_best_effort(self.inner.cache.as_ref(), keys::RECOVERY_ACTIVATED, &tenant_id, self.inner.attempts_ttl);
        }

        let redirect = match tenant_id {
            None => RedirectOutcome::NoTenant,
            Some(_) if trigger == Trigger::Automatic && !self.inner.config.auto_redirect => RedirectOutcome::AutoRedirectDisabled,
            Some(tenant_id) => self.redirect(self.inner.config.destination_for(&tenant_id.to_string()), Some(token), true),
        };

        RecoveryOutcome::Recovering { tenant_id, redirect }
    }

    fn recovery_reason(&self) -> Option<&'static str> {
        {
            let state = self.inner.state.borrow();
            if state.provider_unreliable {
                return Some("provider_unreliable");
            }
            if state.network == NetworkStatus::Offline {
                return Some("offline");
            }
        }

        if self.attempts() >= self.inner.config.attempt_threshold {
            Some("attempt_threshold")
        } else if self.inner.breaker.state() == CircuitState::Open {
            Some("circuit_open")
        } else {
            None
        }
    }

    fn enter_recovery_mode(&self, token: &CancellationToken, reason: &'static str) {
        let entered = self.update(token, |state| {
            if state.phase == RecoveryPhase::Normal {
                state.phase = RecoveryPhase::RecoveryMode;
            }
        });
        store_best_effort(self.inner.cache.as_ref(), keys::RECOVERY_ACTIVATED, &true, self.inner.attempts_ttl);

        if entered {
            tracing::event!(
                name: "tenant_guard.recovery.entered",
                tracing::Level::WARN,
                recovery.reason = reason,
                recovery.attempts = self.attempts(),
            );
        }
    }

    /// Navigates to `destination` unless another redirect holds the flag.
    ///
    /// State is only updated for a mounted caller, identified by its mount `token`.
    fn redirect(&self, destination: String, token: Option<&CancellationToken>, skip_if_there: bool) -> RedirectOutcome {
        if skip_if_there && is_at(&self.inner.navigator.current_location(), &destination) {
            return RedirectOutcome::AlreadyAtDestination;
        }

        let Some(guard) = self.inner.redirect_flag.try_acquire() else {
            tracing::event!(
                name: "tenant_guard.recovery.redirect_skipped",
                tracing::Level::DEBUG,
                destination = %destination,
            );
            return RedirectOutcome::InFlight;
        };

        self.inner.navigator.navigate(&destination);
        if let Some(token) = token {
            self.update(token, |state| state.phase = RecoveryPhase::Redirecting);
        }
        tracing::event!(
            name: "tenant_guard.recovery.redirected",
            tracing::Level::INFO,
            destination = %destination,
        );

        self.release_after_safety_net(guard, token.cloned());
        RedirectOutcome::Navigated { destination }
    }

    /// Holds the redirect flag until the safety-net timer fires or the mount is cancelled.
    ///
    /// Without a mount token the flag is held for the full timer and no state is touched.
    fn release_after_safety_net(&self, guard: InFlightGuard, token: Option<CancellationToken>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Without a runtime there is no timer to hold the flag; release right away.
            drop(guard);
            return;
        };

        let orchestrator = self.clone();
        let reset_after = self.inner.config.redirect_reset();
        let cancelled = token.clone().unwrap_or_default();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => {}
                () = tokio::time::sleep(reset_after) => {
                    if let Some(token) = token {
                        orchestrator.update(&token, |state| {
                            if state.phase == RecoveryPhase::Redirecting {
                                state.phase = RecoveryPhase::Normal;
                            }
                        });
                    }
                }
            }
            drop(guard);
        });
    }

    fn observe_network(&self, event: &NetworkEvent, token: &CancellationToken) {
        let changed = self.update(token, |state| state.network = event.quality);
        if changed {
            tracing::event!(
                name: "tenant_guard.recovery.network_changed",
                tracing::Level::INFO,
                network.quality = %event.quality,
                network.kind = %event.kind,
            );
        }
    }

    async fn watch_network(self, mut events: broadcast::Receiver<NetworkEvent>, token: CancellationToken) {
        let debounce = self.inner.config.network_debounce();

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => self.observe_network(&event, &token),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                },
            }

            // Collapse the burst: wait until the feed has been quiet for the debounce window.
            let quiet = tokio::time::sleep(debounce);
            tokio::pin!(quiet);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    () = &mut quiet => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            self.observe_network(&event, &token);
                            quiet.as_mut().reset(Instant::now() + debounce);
                        }
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            // A rate-limited check is retried once the cool-down ends so the last change is
            // never dropped.
            let mut outcome = self.check_recovery().await;
            while let RecoveryOutcome::CoolingDown { retry_after } = outcome {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(retry_after) => {}
                }
                outcome = self.check_recovery().await;
            }
            tracing::debug!(outcome = ?outcome, "network triggered recovery check finished");
        }
    }
}

/// Returns `true` when `location` is `destination` or continues it past a path, query or
/// fragment boundary.
fn is_at(location: &str, destination: &str) -> bool {
    location
        .strip_prefix(destination)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?', '#']))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tracing_test::traced_test;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::ProviderError;
    use crate::provider::ResilientIdentity;
    use crate::resilient::ResilientCaller;
    use crate::resolve::TenantId;
    use crate::testing::{FakeProvider, RecordingNavigator};

    const TENANT: &str = "5b1c2d3e-4f50-4a61-9b72-8c9d0e1f2a3b";

    type Orchestrator = RecoveryOrchestrator<FakeProvider, MemoryCache, RecordingNavigator>;

    struct Harness {
        orchestrator: Orchestrator,
        provider: Arc<FakeProvider>,
        navigator: Arc<RecordingNavigator>,
        feed: NetworkFeed,
    }

    fn harness_with(config: &GuardConfig, location: &str) -> Harness {
        let provider = Arc::new(FakeProvider::with_tenant(TENANT));
        let navigator = Arc::new(RecordingNavigator::new(location));
        let caller = ResilientCaller::new(
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            Arc::new(MemoryCache::from_config(&config.cache)),
            config.retry.clone(),
        );
        let identity = ResilientIdentity::new(Arc::clone(&provider), caller, config);
        let resolver = Arc::new(IdentityResolver::new(identity, Arc::clone(&navigator), config));
        let feed = NetworkFeed::new();

        Harness {
            orchestrator: RecoveryOrchestrator::new(resolver, feed.clone(), config),
            provider,
            navigator,
            feed,
        }
    }

    fn harness(location: &str) -> Harness {
        harness_with(&GuardConfig::default(), location)
    }

    fn destination() -> String {
        format!("/{TENANT}/dashboard")
    }

    fn tenant() -> Option<TenantId> {
        TenantId::parse(TENANT)
    }

    async fn mount_healthy(harness: &Harness) {
        assert_eq!(harness.orchestrator.mount().await, RecoveryOutcome::Healthy);
        tokio::time::sleep(Duration::from_secs(10)).await;
    }

    fn exceed_attempts(orchestrator: &Orchestrator) {
        for _ in 0..3 {
            orchestrator.record_provider_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn checks_require_mounting() {
        let harness = harness("/login");

        assert_eq!(harness.orchestrator.check_recovery().await, RecoveryOutcome::NotMounted);
        assert!(!harness.orchestrator.state().mounted);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_threshold_enters_recovery_and_redirects() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;
        exceed_attempts(orchestrator);

        let outcome = orchestrator.check_recovery().await;

        assert_eq!(
            outcome,
            RecoveryOutcome::Recovering {
                tenant_id: tenant(),
                redirect: RedirectOutcome::Navigated { destination: destination() },
            }
        );
        assert_eq!(harness.navigator.navigations(), vec![destination()]);
        let state = orchestrator.state();
        assert_eq!(state.phase, RecoveryPhase::Redirecting);
        assert!(state.is_recovery_mode());
        assert_eq!(state.recovered_tenant, tenant());
        assert_eq!(state.attempts, 3);
        assert!(!state.is_loading);
        assert_eq!(orchestrator.inner.cache.get_as::<TenantId>(keys::RECOVERY_ACTIVATED), tenant());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(orchestrator.phase(), RecoveryPhase::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn checks_are_rate_limited() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        assert_eq!(orchestrator.mount().await, RecoveryOutcome::Healthy);

        tokio::time::sleep(Duration::from_secs(4)).await;
        let RecoveryOutcome::CoolingDown { retry_after } = orchestrator.check_recovery().await else {
            panic!("expected the check to be rate limited");
        };
        assert!(retry_after > Duration::from_secs(5) && retry_after <= Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(orchestrator.check_recovery().await, RecoveryOutcome::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_recoveries_navigate_once() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;

        let (first, second) = tokio::join!(orchestrator.trigger_recovery(), orchestrator.trigger_recovery());

        assert!(matches!(
            first,
            RecoveryOutcome::Recovering {
                redirect: RedirectOutcome::Navigated { .. },
                ..
            }
        ));
        assert!(matches!(
            second,
            RecoveryOutcome::CoolingDown { .. } | RecoveryOutcome::CheckInFlight
        ));
        assert_eq!(harness.navigator.navigations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_recover_honors_redirect_in_flight() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;
        orchestrator.trigger_recovery().await;

        assert_eq!(orchestrator.emergency_recover(), RedirectOutcome::InFlight);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            orchestrator.emergency_recover(),
            RedirectOutcome::Navigated {
                destination: "/login".to_string()
            }
        );
        assert_eq!(harness.navigator.navigations(), vec![destination(), "/login".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_recover_while_unmounted_leaves_state_alone() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        orchestrator.mount().await;
        orchestrator.unmount();
        let states = orchestrator.subscribe();

        assert!(matches!(orchestrator.emergency_recover(), RedirectOutcome::Navigated { .. }));
        assert_eq!(orchestrator.state(), RecoveryState::default());
        assert_eq!(orchestrator.emergency_recover(), RedirectOutcome::InFlight);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(orchestrator.state(), RecoveryState::default());
        assert!(!states.has_changed().unwrap());
        assert!(matches!(orchestrator.emergency_recover(), RedirectOutcome::Navigated { .. }));
        assert_eq!(harness.navigator.navigations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_redirect_disabled_only_blocks_automatic_checks() {
        let mut config = GuardConfig::default();
        config.recovery.auto_redirect = false;
        let harness = harness_with(&config, "/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;
        orchestrator.signal_provider_unreliable();

        assert_eq!(
            orchestrator.check_recovery().await,
            RecoveryOutcome::Recovering {
                tenant_id: tenant(),
                redirect: RedirectOutcome::AutoRedirectDisabled,
            }
        );
        assert_eq!(orchestrator.phase(), RecoveryPhase::RecoveryMode);
        assert!(harness.navigator.navigations().is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(
            orchestrator.trigger_recovery().await,
            RecoveryOutcome::Recovering {
                redirect: RedirectOutcome::Navigated { .. },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn no_redirect_when_already_at_destination() {
        let harness = harness(&format!("/{TENANT}/dashboard?tab=usage"));
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;

        assert_eq!(
            orchestrator.trigger_recovery().await,
            RecoveryOutcome::Recovering {
                tenant_id: tenant(),
                redirect: RedirectOutcome::AlreadyAtDestination,
            }
        );
        assert!(harness.navigator.navigations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lookalike_location_still_redirects() {
        let harness = harness(&format!("/{TENANT}/dashboard-old"));
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;

        assert_eq!(
            orchestrator.trigger_recovery().await,
            RecoveryOutcome::Recovering {
                tenant_id: tenant(),
                redirect: RedirectOutcome::Navigated { destination: destination() },
            }
        );
        assert_eq!(harness.navigator.navigations(), vec![destination()]);
    }

    #[rstest]
    #[case("/t/dashboard", true)]
    #[case("/t/dashboard/", true)]
    #[case("/t/dashboard/settings", true)]
    #[case("/t/dashboard?tab=usage", true)]
    #[case("/t/dashboard#top", true)]
    #[case("/t/dashboard-old", false)]
    #[case("/t/dashboards", false)]
    #[case("/t", false)]
    fn location_matching_respects_path_boundaries(#[case] location: &str, #[case] expected: bool) {
        assert_eq!(is_at(location, "/t/dashboard"), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_triggers_recovery_with_memoized_identity() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;
        orchestrator.trigger_recovery().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        harness.navigator.set_location("/login");

        for _ in 0..3 {
            orchestrator.inner.breaker.record_failure(&ProviderError::Network("down".into()));
        }
        let calls_before = harness.provider.attribute_calls();
        let outcome = orchestrator.check_recovery().await;

        assert!(matches!(
            outcome,
            RecoveryOutcome::Recovering {
                redirect: RedirectOutcome::Navigated { .. },
                ..
            }
        ));
        assert_eq!(harness.provider.attribute_calls(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn network_bursts_are_debounced_into_one_check() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;

        for _ in 0..3 {
            harness.feed.publish(NetworkEvent::new(NetworkStatus::Offline, "wifi"));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.state().network, NetworkStatus::Offline);
        assert!(harness.navigator.navigations().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.navigator.navigations(), vec![destination()]);
    }

    #[tokio::test(start_paused = true)]
    async fn network_change_during_cooldown_is_checked_when_it_ends() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        assert_eq!(orchestrator.mount().await, RecoveryOutcome::Healthy);

        tokio::time::sleep(Duration::from_secs(2)).await;
        harness.feed.publish(NetworkEvent::new(NetworkStatus::Offline, "wifi"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orchestrator.state().network, NetworkStatus::Offline);
        assert!(harness.navigator.navigations().is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.navigator.navigations(), vec![destination()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_during_check_leaves_state_untouched() {
        let harness = harness("/login");
        let orchestrator = harness.orchestrator.clone();
        mount_healthy(&harness).await;
        harness.provider.set_latency(Duration::from_secs(2));
        exceed_attempts(&orchestrator);

        let running = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.check_recovery().await }
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        orchestrator.unmount();

        assert_eq!(running.await.unwrap(), RecoveryOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(orchestrator.state(), RecoveryState::default());
        assert!(harness.navigator.navigations().is_empty());
        assert_eq!(orchestrator.attempts(), 3);
        assert!(harness.orchestrator.inner.cache.get(keys::TENANT_ID).is_none());
        assert_eq!(harness.feed.subscriber_count(), 0);
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn lifecycle_events_are_logged() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;
        orchestrator.signal_provider_unreliable();
        orchestrator.complete_recovery();
        orchestrator.unmount();

        assert!(logs_contain("recovery mounted"));
        assert!(logs_contain("identity provider marked unreliable"));
        assert!(logs_contain("recovery completed"));
        assert!(logs_contain("recovery unmounted"));
    }

    #[tokio::test(start_paused = true)]
    async fn complete_recovery_returns_to_normal() {
        let harness = harness("/login");
        let orchestrator = &harness.orchestrator;
        mount_healthy(&harness).await;
        exceed_attempts(orchestrator);
        orchestrator.signal_provider_unreliable();
        orchestrator.check_recovery().await;

        orchestrator.complete_recovery();

        let state = orchestrator.state();
        assert_eq!(state.phase, RecoveryPhase::Normal);
        assert!(!state.provider_unreliable);
        assert_eq!(state.attempts, 0);
        assert_eq!(orchestrator.attempts(), 0);
        assert!(orchestrator.inner.cache.get(keys::RECOVERY_ACTIVATED).is_none());
        assert_eq!(orchestrator.inner.breaker.state(), CircuitState::Closed);
    }
}
