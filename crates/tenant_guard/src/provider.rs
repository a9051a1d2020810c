// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The external identity provider and its resilient façade.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheStore, CacheStoreExt, keys, store_best_effort};
use crate::config::GuardConfig;
use crate::error::{IdentityError, ProviderError};
use crate::resilient::{CallOptions, ResilientCaller, Sourced, ValueSource};
use crate::resolve::TenantId;

/// Attribute map returned by the provider, keyed by attribute name.
pub type Attributes = BTreeMap<String, String>;

/// The signed-in user as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct User {
    /// Provider-assigned user name.
    pub username: String,
    /// Stable user identifier.
    pub user_id: String,
}

impl User {
    /// Creates a user.
    #[must_use]
    pub fn new(username: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            user_id: user_id.into(),
        }
    }
}

/// Authentication session tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    /// Token used to call protected APIs.
    pub access_token: String,
    /// Token carrying identity claims, when issued.
    pub id_token: Option<String>,
}

impl Session {
    /// Creates a session.
    #[must_use]
    pub fn new(access_token: impl Into<String>, id_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            id_token,
        }
    }
}

/// Calls exposed by the external identity provider.
///
/// Every call may fail with [`ProviderError::Timeout`] or [`ProviderError::Network`]
/// (transient), or with [`ProviderError::NotAuthorized`] or
/// [`ProviderError::UserNotFound`] (definitive).
pub trait IdentityProvider: Send + Sync + 'static {
    /// Returns the signed-in user.
    fn get_current_user(&self) -> impl Future<Output = Result<User, ProviderError>> + Send;

    /// Returns the signed-in user's attributes.
    fn fetch_attributes(&self) -> impl Future<Output = Result<Attributes, ProviderError>> + Send;

    /// Returns the current session, refreshing tokens when `force_refresh` is set.
    fn fetch_session(&self, force_refresh: bool) -> impl Future<Output = Result<Session, ProviderError>> + Send;
}

/// Operation key used for [`ResilientIdentity::current_user`].
pub const OP_CURRENT_USER: &str = "identity.current_user";

/// Operation key used for [`ResilientIdentity::attributes`].
pub const OP_ATTRIBUTES: &str = "identity.attributes";

/// Operation key used for [`ResilientIdentity::session`].
pub const OP_SESSION: &str = "identity.session";

/// Resilient façade over an [`IdentityProvider`].
///
/// Each provider call goes through the shared [`ResilientCaller`], so it is memoized,
/// coalesced, gated by the circuit breaker, retried and backed by cached values. Results
/// are mirrored into the well-known cache keys so other components can read them as
/// ambient hints.
#[derive(Debug)]
pub struct ResilientIdentity<P, C> {
    provider: Arc<P>,
    caller: ResilientCaller<C>,
    tenant_attribute: String,
}

impl<P, C> Clone for ResilientIdentity<P, C> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            caller: self.caller.clone(),
            tenant_attribute: self.tenant_attribute.clone(),
        }
    }
}

impl<P, C> ResilientIdentity<P, C>
where
    P: IdentityProvider,
    C: CacheStore + 'static,
{
    /// Creates the façade.
    #[must_use]
    pub fn new(provider: Arc<P>, caller: ResilientCaller<C>, config: &GuardConfig) -> Self {
        Self {
            provider,
            caller,
            tenant_attribute: config.resolver.tenant_attribute.clone(),
        }
    }

    /// The shared resilient caller.
    #[must_use]
    pub fn caller(&self) -> &ResilientCaller<C> {
        &self.caller
    }

    /// Name of the attribute holding the tenant id.
    #[must_use]
    pub fn tenant_attribute(&self) -> &str {
        &self.tenant_attribute
    }

    /// Returns the signed-in user.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] when the provider and every fallback fail.
    pub async fn current_user(&self, options: &CallOptions) -> Result<User, IdentityError> {
        let provider = Arc::clone(&self.provider);
        let user = self
            .caller
            .call(OP_CURRENT_USER, options, move || {
                let provider = Arc::clone(&provider);
                async move { provider.get_current_user().await }
            })
            .await?;

        store_best_effort(self.caller.cache(), keys::USER_CURRENT, &user, self.caller.config().fallback_ttl());
        Ok(user)
    }

    /// Returns the signed-in user's attributes.
    ///
    /// When the circuit is open and no cached attributes exist, a minimal attribute map
    /// holding only the tenant id is derived from any tenant id persisted locally.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] when the provider and every fallback fail.
    pub async fn attributes(&self, options: &CallOptions) -> Result<Attributes, IdentityError> {
        self.attributes_sourced(options).await.map(Sourced::into_value)
    }

    /// Like [`attributes`][Self::attributes], but reports whether the map came from the
    /// provider or from a fallback.
    ///
    /// Derived maps are not mirrored into the ambient `user.attributes` key.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] when the provider and every fallback fail.
    pub async fn attributes_sourced(&self, options: &CallOptions) -> Result<Sourced<Attributes>, IdentityError> {
        let provider = Arc::clone(&self.provider);
        let cache = self.caller.cache_arc();
        let tenant_attribute = self.tenant_attribute.clone();

        let attributes = self
            .caller
            .call_sourced(
                OP_ATTRIBUTES,
                options,
                move || {
                    let provider = Arc::clone(&provider);
                    async move { provider.fetch_attributes().await }
                },
                move || derive_attributes(cache.as_ref(), &tenant_attribute),
            )
            .await?;

        if attributes.source != ValueSource::Derived {
            store_best_effort(
                self.caller.cache(),
                keys::USER_ATTRIBUTES,
                &attributes.value,
                self.caller.config().fallback_ttl(),
            );
        }
        Ok(attributes)
    }

    /// Returns the current session.
    ///
    /// A forced refresh always reaches the provider (subject to the breaker) instead of
    /// reusing a memoized session.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] when the provider and every fallback fail.
    pub async fn session(&self, force_refresh: bool, options: &CallOptions) -> Result<Session, IdentityError> {
        let provider = Arc::clone(&self.provider);
        let mut options = options.clone();
        if force_refresh {
            options.use_memoized = false;
        }

        let session = self
            .caller
            .call(OP_SESSION, &options, move || {
                let provider = Arc::clone(&provider);
                async move { provider.fetch_session(force_refresh).await }
            })
            .await?;

        store_best_effort(self.caller.cache(), keys::AUTH_SESSION, &session, self.caller.config().fallback_ttl());
        Ok(session)
    }
}

/// Builds a minimal attribute map from a locally known tenant id.
fn derive_attributes<C: CacheStore + ?Sized>(cache: &C, tenant_attribute: &str) -> Option<Attributes> {
    let tenant = [keys::TENANT_RELIABLE, keys::TENANT_ID]
        .into_iter()
        .filter_map(|key| cache.get_as::<String>(key))
        .find_map(|raw| TenantId::parse(&raw))?;

    Some(Attributes::from([(tenant_attribute.to_string(), tenant.to_string())]))
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryCache;

    const TENANT: &str = "3f6a1e2b-9c3d-4a11-8b2f-1234567890ab";

    #[test]
    fn derive_prefers_reliable_tenant() {
        let cache = MemoryCache::new();
        cache.set_as(keys::TENANT_ID, "not-a-uuid", Duration::from_secs(60)).unwrap();
        cache.set_as(keys::TENANT_RELIABLE, TENANT, Duration::from_secs(60)).unwrap();

        let attributes = derive_attributes(&cache, "custom:tenantId").unwrap();

        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes.get("custom:tenantId").map(String::as_str), Some(TENANT));
    }

    #[test]
    fn derive_skips_invalid_ids() {
        let cache = MemoryCache::new();
        cache.set_as(keys::TENANT_ID, "legacy-42", Duration::from_secs(60)).unwrap();

        assert!(derive_attributes(&cache, "custom:tenantId").is_none());
    }
}
