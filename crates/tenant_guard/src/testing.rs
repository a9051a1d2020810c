// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scriptable fakes for the external collaborators.
//!
//! [`FakeProvider`] answers identity calls from a script and counts them,
//! [`RecordingNavigator`] records every navigation instead of performing it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::ProviderError;
use crate::provider::{Attributes, IdentityProvider, Session, User};
use crate::recovery::Navigator;

/// Attribute name used by [`FakeProvider::with_tenant`].
pub const TENANT_ATTRIBUTE: &str = "custom:tenantId";

#[derive(Debug)]
struct Script<T> {
    queued: Mutex<VecDeque<Result<T, ProviderError>>>,
    standing: Mutex<Result<T, ProviderError>>,
    calls: AtomicU32,
}

impl<T: Clone> Script<T> {
    fn new(standing: Result<T, ProviderError>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            standing: Mutex::new(standing),
            calls: AtomicU32::new(0),
        }
    }

    fn next(&self) -> Result<T, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queued.lock().pop_front().unwrap_or_else(|| self.standing.lock().clone())
    }

    fn set(&self, result: Result<T, ProviderError>) {
        *self.standing.lock() = result;
    }

    fn push(&self, result: Result<T, ProviderError>) {
        self.queued.lock().push_back(result);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// An [`IdentityProvider`] driven by scripted responses.
///
/// Each call first consumes a queued one-shot response, then falls back to the standing
/// response. An optional latency is applied to every call.
#[derive(Debug)]
pub struct FakeProvider {
    user: Script<User>,
    attributes: Script<Attributes>,
    session: Script<Session>,
    latency: Mutex<Duration>,
    last_force_refresh: AtomicBool,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// A provider that knows a user without any attributes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            user: Script::new(Ok(User::new("alice", "user-1"))),
            attributes: Script::new(Ok(Attributes::new())),
            session: Script::new(Ok(Session::new("access-token", Some("id-token".to_string())))),
            latency: Mutex::new(Duration::ZERO),
            last_force_refresh: AtomicBool::new(false),
        }
    }

    /// A provider whose attributes carry `tenant` under [`TENANT_ATTRIBUTE`].
    #[must_use]
    pub fn with_tenant(tenant: &str) -> Self {
        let provider = Self::new();
        provider.set_attributes(Ok(Attributes::from([(TENANT_ATTRIBUTE.to_string(), tenant.to_string())])));
        provider
    }

    /// Replaces the standing response of [`IdentityProvider::get_current_user`].
    pub fn set_user(&self, result: Result<User, ProviderError>) {
        self.user.set(result);
    }

    /// Replaces the standing response of [`IdentityProvider::fetch_attributes`].
    pub fn set_attributes(&self, result: Result<Attributes, ProviderError>) {
        self.attributes.set(result);
    }

    /// Replaces the standing response of [`IdentityProvider::fetch_session`].
    pub fn set_session(&self, result: Result<Session, ProviderError>) {
        self.session.set(result);
    }

    /// Queues a one-shot response for the next attributes call.
    pub fn push_attributes(&self, result: Result<Attributes, ProviderError>) {
        self.attributes.push(result);
    }

    /// Queues a one-shot response for the next user call.
    pub fn push_user(&self, result: Result<User, ProviderError>) {
        self.user.push(result);
    }

    /// Delays every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of user calls made.
    #[must_use]
    pub fn user_calls(&self) -> u32 {
        self.user.calls()
    }

    /// Number of attributes calls made.
    #[must_use]
    pub fn attribute_calls(&self) -> u32 {
        self.attributes.calls()
    }

    /// Number of session calls made.
    #[must_use]
    pub fn session_calls(&self) -> u32 {
        self.session.calls()
    }

    /// The `force_refresh` flag of the latest session call.
    #[must_use]
    pub fn last_force_refresh(&self) -> bool {
        self.last_force_refresh.load(Ordering::SeqCst)
    }

    async fn respond<T: Clone>(&self, script: &Script<T>) -> Result<T, ProviderError> {
        let result = script.next();
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result
    }
}

impl IdentityProvider for FakeProvider {
    async fn get_current_user(&self) -> Result<User, ProviderError> {
        self.respond(&self.user).await
    }

    async fn fetch_attributes(&self) -> Result<Attributes, ProviderError> {
        self.respond(&self.attributes).await
    }

    async fn fetch_session(&self, force_refresh: bool) -> Result<Session, ProviderError> {
        self.last_force_refresh.store(force_refresh, Ordering::SeqCst);
        self.respond(&self.session).await
    }
}

/// A [`Navigator`] that records navigations and moves its location accordingly.
#[derive(Debug)]
pub struct RecordingNavigator {
    location: Mutex<String>,
    navigations: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    /// Starts at `location`.
    #[must_use]
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: Mutex::new(location.into()),
            navigations: Mutex::new(Vec::new()),
        }
    }

    /// Moves to `location` without recording a navigation.
    pub fn set_location(&self, location: impl Into<String>) {
        *self.location.lock() = location.into();
    }

    /// Every path navigated to, oldest first.
    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn current_location(&self) -> String {
        self.location.lock().clone()
    }

    fn navigate(&self, path: &str) {
        self.navigations.lock().push(path.to_string());
        self.set_location(path);
    }
}
