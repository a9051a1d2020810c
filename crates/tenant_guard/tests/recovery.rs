// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests for recovery orchestration.

#![cfg(feature = "test-util")]

use std::sync::Arc;
use std::time::Duration;

use tenant_guard::breaker::CircuitBreaker;
use tenant_guard::cache::{CacheStore, CacheStoreExt, MemoryCache, keys};
use tenant_guard::provider::ResilientIdentity;
use tenant_guard::recovery::{NetworkFeed, RecoveryOrchestrator, RecoveryOutcome, RecoveryPhase, RedirectOutcome};
use tenant_guard::resilient::ResilientCaller;
use tenant_guard::resolve::IdentityResolver;
use tenant_guard::testing::{FakeProvider, RecordingNavigator};
use tenant_guard::{GuardConfig, ProviderError};

const TENANT: &str = "c2d4e6f8-0a1b-4c3d-9e5f-6a7b8c9d0e1f";

type Orchestrator = RecoveryOrchestrator<FakeProvider, MemoryCache, RecordingNavigator>;

fn build(config: &GuardConfig, provider: FakeProvider, location: &str) -> (Orchestrator, Arc<MemoryCache>, Arc<RecordingNavigator>) {
    let cache = Arc::new(MemoryCache::from_config(&config.cache));
    let navigator = Arc::new(RecordingNavigator::new(location));
    let caller = ResilientCaller::new(
        Arc::new(CircuitBreaker::new(config.breaker.clone())),
        Arc::clone(&cache),
        config.retry.clone(),
    );
    let identity = ResilientIdentity::new(Arc::new(provider), caller, config);
    let resolver = Arc::new(IdentityResolver::new(identity, Arc::clone(&navigator), config));

    (RecoveryOrchestrator::new(resolver, NetworkFeed::new(), config), cache, navigator)
}

#[tokio::test(start_paused = true)]
async fn failing_provider_recovers_to_the_last_confirmed_tenant() {
    let provider = FakeProvider::new();
    provider.set_attributes(Err(ProviderError::Timeout(Duration::from_secs(5))));
    let (orchestrator, cache, navigator) = build(&GuardConfig::default(), provider, "/login");
    cache
        .set_as(keys::TENANT_RELIABLE, TENANT, Duration::from_secs(3_600))
        .unwrap();
    let mut states = orchestrator.subscribe();

    for _ in 0..3 {
        orchestrator.record_provider_failure();
    }
    let outcome = orchestrator.mount().await;

    let RecoveryOutcome::Recovering { tenant_id, redirect } = outcome else {
        panic!("expected recovery, got {outcome:?}");
    };
    assert_eq!(tenant_id.map(|id| id.to_string()).as_deref(), Some(TENANT));
    assert_eq!(
        redirect,
        RedirectOutcome::Navigated {
            destination: format!("/{TENANT}/dashboard")
        }
    );
    assert_eq!(navigator.navigations().len(), 1);
    assert_eq!(cache.get_as::<String>(keys::RECOVERY_ACTIVATED).as_deref(), Some(TENANT));
    assert!(states.has_changed().unwrap());
    assert_eq!(states.borrow_and_update().phase, RecoveryPhase::Redirecting);

    orchestrator.complete_recovery();
    assert_eq!(orchestrator.attempts(), 0);
    assert_eq!(orchestrator.phase(), RecoveryPhase::Normal);
    assert!(cache.get(keys::RECOVERY_ACTIVATED).is_none());

    orchestrator.unmount();
    assert!(!orchestrator.is_mounted());
}

#[tokio::test(start_paused = true)]
async fn emergency_recovery_works_without_mounting() {
    let (orchestrator, _cache, navigator) = build(&GuardConfig::default(), FakeProvider::with_tenant(TENANT), "/login");

    assert_eq!(orchestrator.check_recovery().await, RecoveryOutcome::NotMounted);
    assert!(navigator.navigations().is_empty());

    assert_eq!(
        orchestrator.emergency_recover(),
        RedirectOutcome::Navigated {
            destination: "/login".to_string()
        }
    );
    assert_eq!(orchestrator.emergency_recover(), RedirectOutcome::InFlight);
    assert_eq!(navigator.navigations(), vec!["/login".to_string()]);
}
