// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tenant identity resolution.
//!
//! [`IdentityResolver`] reconciles the places a tenant id can come from and returns the first
//! format-valid candidate, in this order:
//!
//! 1. [`IdentitySource::Provider`]: the tenant attribute returned by the identity provider.
//!    Degraded attribute maps (cached or derived) do not count.
//! 2. [`IdentitySource::ReliableCache`]: the last id confirmed by a previous resolution.
//! 3. [`IdentitySource::UrlPath`]: an id embedded in the current location path or query.
//! 4. [`IdentitySource::AmbientCache`]: the ambient `tenant.id` key, then the tenant attribute
//!    inside cached `user.attributes`.
//!
//! Later sources never override an earlier one within a single resolution. Every resolved
//! id is written through to the reliable and ambient cache keys, so the next resolution can
//! short-circuit at step 2 when the provider is down.

mod tenant;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
pub use tenant::{InvalidTenantId, TenantId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStore, CacheStoreExt, keys, store_best_effort};
use crate::config::GuardConfig;
use crate::error::IdentityError;
use crate::provider::{Attributes, IdentityProvider, ResilientIdentity};
use crate::recovery::Navigator;
use crate::resilient::CallOptions;
use crate::telemetry;

/// Operation name reported when a resolution is cancelled.
const OP_RESOLVE: &str = "resolve.tenant";

/// Where a resolved tenant id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum IdentitySource {
    /// The identity provider's attributes.
    Provider,
    /// The id confirmed by an earlier resolution.
    ReliableCache,
    /// The current location.
    UrlPath,
    /// Any previously cached id.
    AmbientCache,
}

impl IdentitySource {
    /// Stable lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::ReliableCache => "reliable_cache",
            Self::UrlPath => "url_path",
            Self::AmbientCache => "ambient_cache",
        }
    }
}

impl Display for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant id together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ResolvedIdentity {
    /// The resolved tenant id.
    pub tenant_id: TenantId,
    /// Where it came from.
    pub source: IdentitySource,
    /// When it was resolved.
    pub resolved_at: Instant,
}

/// Resolves the current tenant id from every available source.
#[derive(Debug)]
pub struct IdentityResolver<P, C, N> {
    identity: ResilientIdentity<P, C>,
    navigator: Arc<N>,
    tenant_ttl: Duration,
    last: Mutex<Option<ResolvedIdentity>>,
}

impl<P, C, N> IdentityResolver<P, C, N>
where
    P: IdentityProvider,
    C: CacheStore + 'static,
    N: Navigator,
{
    /// Creates a resolver.
    #[must_use]
    pub fn new(identity: ResilientIdentity<P, C>, navigator: Arc<N>, config: &GuardConfig) -> Self {
        Self {
            identity,
            navigator,
            tenant_ttl: config.cache.tenant_ttl(),
            last: Mutex::new(None),
        }
    }

    /// The resilient identity façade used for the provider step.
    #[must_use]
    pub fn identity(&self) -> &ResilientIdentity<P, C> {
        &self.identity
    }

    /// The navigator consulted for the location step.
    #[must_use]
    pub fn navigator(&self) -> &Arc<N> {
        &self.navigator
    }

    /// The most recent successful resolution, if any.
    #[must_use]
    pub fn last_resolved(&self) -> Option<ResolvedIdentity> {
        self.last.lock().clone()
    }

    /// Resolves the tenant id, reusing a recent provider answer when one is memoized.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::ResolutionExhausted`] when no source yields a valid id and
    /// [`IdentityError::Cancelled`] when `cancellation` fires.
    pub async fn resolve(&self, cancellation: &CancellationToken) -> Result<ResolvedIdentity, IdentityError> {
        self.resolve_with(CallOptions::new().cancellation(cancellation.clone())).await
    }

    /// Resolves the tenant id, asking the provider again instead of reusing a memoized answer.
    ///
    /// # Errors
    ///
    /// Same as [`resolve`][Self::resolve].
    pub async fn resolve_fresh(&self, cancellation: &CancellationToken) -> Result<ResolvedIdentity, IdentityError> {
        self.resolve_with(CallOptions::new().cancellation(cancellation.clone()).memoized(false))
            .await
    }

    async fn resolve_with(&self, options: CallOptions) -> Result<ResolvedIdentity, IdentityError> {
        let started = Instant::now();

        let from_provider = self.from_provider(&options).await?;
        if options.cancellation.is_cancelled() {
            return Err(IdentityError::Cancelled { operation: OP_RESOLVE.into() });
        }

        let candidate = from_provider
            .map(|id| (id, IdentitySource::Provider))
            .or_else(|| self.from_reliable_cache().map(|id| (id, IdentitySource::ReliableCache)))
            .or_else(|| TenantId::find_in_location(&self.navigator.current_location()).map(|id| (id, IdentitySource::UrlPath)))
            .or_else(|| self.from_ambient_cache().map(|id| (id, IdentitySource::AmbientCache)));

        let Some((tenant_id, source)) = candidate else {
            tracing::event!(
                name: "tenant_guard.resolve.exhausted",
                tracing::Level::WARN,
                elapsed_ms = telemetry::millis(started.elapsed()),
            );
            return Err(IdentityError::ResolutionExhausted);
        };

        let cache = self.identity.caller().cache();
        store_best_effort(cache, keys::TENANT_RELIABLE, &tenant_id, self.tenant_ttl);
        store_best_effort(cache, keys::TENANT_ID, &tenant_id, self.tenant_ttl);

        let resolved = ResolvedIdentity {
            tenant_id,
            source,
            resolved_at: Instant::now(),
        };
        *self.last.lock() = Some(resolved.clone());

        tracing::event!(
            name: "tenant_guard.resolve.resolved",
            tracing::Level::INFO,
            tenant.source = source.as_str(),
            elapsed_ms = telemetry::millis(started.elapsed()),
        );
        Ok(resolved)
    }

    async fn from_provider(&self, options: &CallOptions) -> Result<Option<TenantId>, IdentityError> {
        match self.identity.attributes_sourced(options).await {
            Ok(attributes) if attributes.source.is_authoritative() => Ok(self.tenant_in(&attributes.value)),
            Ok(_) => Ok(None),
            Err(error) if error.is_cancelled() => Err(error),
            Err(error) => {
                tracing::debug!(error = %error, "provider step yielded no tenant id");
                Ok(None)
            }
        }
    }

    fn from_reliable_cache(&self) -> Option<TenantId> {
        let raw = self.identity.caller().cache().get_as::<String>(keys::TENANT_RELIABLE)?;
        TenantId::parse(&raw)
    }

    fn from_ambient_cache(&self) -> Option<TenantId> {
        let cache = self.identity.caller().cache();
        cache
            .get_as::<String>(keys::TENANT_ID)
            .and_then(|raw| TenantId::parse(&raw))
            .or_else(|| {
                let attributes = cache.get_as::<Attributes>(keys::USER_ATTRIBUTES)?;
                self.tenant_in(&attributes)
            })
    }

    fn tenant_in(&self, attributes: &Attributes) -> Option<TenantId> {
        let raw = attributes.get(self.identity.tenant_attribute())?;
        let parsed = TenantId::parse(raw);
        if parsed.is_none() {
            tracing::debug!(attribute = self.identity.tenant_attribute(), "ignoring tenant attribute with invalid format");
        }
        parsed
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::cache::MemoryCache;
    use crate::error::ProviderError;
    use crate::resilient::ResilientCaller;
    use crate::testing::{FakeProvider, RecordingNavigator};

    const PROVIDER_TENANT: &str = "11111111-1111-4111-8111-111111111111";
    const RELIABLE_TENANT: &str = "22222222-2222-4222-9222-222222222222";
    const URL_TENANT: &str = "33333333-3333-4333-a333-333333333333";
    const AMBIENT_TENANT: &str = "44444444-4444-4444-b444-444444444444";

    type Resolver = IdentityResolver<FakeProvider, MemoryCache, RecordingNavigator>;

    fn resolver(provider: FakeProvider, location: &str) -> (Resolver, Arc<FakeProvider>) {
        let config = GuardConfig::default();
        let provider = Arc::new(provider);
        let caller = ResilientCaller::new(
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            Arc::new(MemoryCache::from_config(&config.cache)),
            config.retry.clone(),
        );
        let identity = ResilientIdentity::new(Arc::clone(&provider), caller, &config);
        let resolver = IdentityResolver::new(identity, Arc::new(RecordingNavigator::new(location)), &config);
        (resolver, provider)
    }

    fn failing_provider() -> FakeProvider {
        let provider = FakeProvider::new();
        provider.set_attributes(Err(ProviderError::Network("unreachable".into())));
        provider
    }

    fn store(resolver: &Resolver, key: &str, value: &str) {
        resolver
            .identity()
            .caller()
            .cache()
            .set_as(key, value, Duration::from_secs(600))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn provider_wins_over_stale_reliable_value() {
        let (resolver, _) = resolver(FakeProvider::with_tenant(PROVIDER_TENANT), "/");
        store(&resolver, keys::TENANT_RELIABLE, RELIABLE_TENANT);

        let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.source, IdentitySource::Provider);
        assert_eq!(resolved.tenant_id.to_string(), PROVIDER_TENANT);
        let cache = resolver.identity().caller().cache();
        assert_eq!(cache.get_as::<String>(keys::TENANT_RELIABLE).as_deref(), Some(PROVIDER_TENANT));
        assert_eq!(cache.get_as::<String>(keys::TENANT_ID).as_deref(), Some(PROVIDER_TENANT));
    }

    #[tokio::test(start_paused = true)]
    async fn provider_failure_falls_back_to_reliable_value() {
        let (resolver, provider) = resolver(failing_provider(), "/");
        store(&resolver, keys::TENANT_RELIABLE, RELIABLE_TENANT);

        let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.source, IdentitySource::ReliableCache);
        assert_eq!(resolved.tenant_id.to_string(), RELIABLE_TENANT);
        assert_eq!(provider.attribute_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn location_is_used_when_caches_are_empty() {
        let location = format!("/{URL_TENANT}/dashboard");
        let (resolver, _) = resolver(failing_provider(), &location);

        let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.source, IdentitySource::UrlPath);
        assert_eq!(resolved.tenant_id.to_string(), URL_TENANT);
        assert_eq!(resolver.last_resolved(), Some(resolved));
        let cache = resolver.identity().caller().cache();
        assert_eq!(cache.get_as::<String>(keys::TENANT_RELIABLE).as_deref(), Some(URL_TENANT));
    }

    #[tokio::test(start_paused = true)]
    async fn ambient_attributes_are_the_last_resort() {
        let (resolver, _) = resolver(failing_provider(), "/login");
        let attributes = Attributes::from([("custom:tenantId".to_string(), AMBIENT_TENANT.to_string())]);
        resolver
            .identity()
            .caller()
            .cache()
            .set_as(keys::USER_ATTRIBUTES, &attributes, Duration::from_secs(600))
            .unwrap();

        let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.source, IdentitySource::AmbientCache);
        assert_eq!(resolved.tenant_id.to_string(), AMBIENT_TENANT);
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_ids_are_rejected_and_the_chain_falls_through() {
        let (resolver, _) = resolver(FakeProvider::with_tenant("12345"), "/login");
        store(&resolver, keys::TENANT_RELIABLE, "legacy-tenant");
        store(&resolver, keys::TENANT_ID, AMBIENT_TENANT);

        let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.source, IdentitySource::AmbientCache);
        assert_eq!(resolved.tenant_id.to_string(), AMBIENT_TENANT);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_found_is_exhaustion() {
        let (resolver, _) = resolver(failing_provider(), "/login");

        let error = resolver.resolve(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(error, IdentityError::ResolutionExhausted);
        assert!(error.requires_reauthentication());
        assert_eq!(resolver.last_resolved(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn definitive_rejection_falls_through_the_chain() {
        let provider = FakeProvider::new();
        provider.set_attributes(Err(ProviderError::NotAuthorized("expired".into())));
        let (resolver, provider) = resolver(provider, "/login");
        store(&resolver, keys::TENANT_RELIABLE, RELIABLE_TENANT);

        let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.source, IdentitySource::ReliableCache);
        assert_eq!(provider.attribute_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_resolution_bypasses_the_memoized_answer() {
        let (resolver, provider) = resolver(FakeProvider::with_tenant(PROVIDER_TENANT), "/");
        let token = CancellationToken::new();

        resolver.resolve(&token).await.unwrap();
        resolver.resolve(&token).await.unwrap();
        assert_eq!(provider.attribute_calls(), 1);

        provider.set_attributes(Ok(Attributes::from([("custom:tenantId".to_string(), URL_TENANT.to_string())])));
        let fresh = resolver.resolve_fresh(&token).await.unwrap();

        assert_eq!(provider.attribute_calls(), 2);
        assert_eq!(fresh.tenant_id.to_string(), URL_TENANT);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_resolution_writes_nothing() {
        let (resolver, _) = resolver(FakeProvider::with_tenant(PROVIDER_TENANT), "/");
        let token = CancellationToken::new();
        token.cancel();

        let error = resolver.resolve(&token).await.unwrap_err();

        assert!(error.is_cancelled());
        assert!(resolver.identity().caller().cache().get(keys::TENANT_ID).is_none());
    }
}
