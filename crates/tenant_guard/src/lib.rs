// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Resilient tenant identity for multi-tenant clients.
//!
//! This crate sits between an application and an unreliable identity provider. It keeps
//! answering "who is the user and which tenant do they belong to" while the provider is slow,
//! flaky or down, and steers the user back to a working tenant landing page when identity
//! falls apart.
//!
//! # Building Blocks
//!
//! - [`breaker::CircuitBreaker`]: stops calling the provider after repeated transient failures
//!   and lets a probe through after a cool-down.
//! - [`resilient::ResilientCaller`]: memoizes and coalesces calls, applies timeouts and
//!   exponential backoff, and falls back to last-known-good values.
//! - [`provider::ResilientIdentity`]: the resilient façade over an [`IdentityProvider`].
//! - [`resolve::IdentityResolver`]: reconciles provider data, cached values and the current
//!   location into one tenant id.
//! - [`recovery::RecoveryOrchestrator`]: detects unhealthy identity and redirects with
//!   at-most-one-in-flight guarantees.
//! - [`cache::CacheStore`]: the TTL store behind every fallback and hint, with
//!   [`cache::MemoryCache`] as the in-process implementation.
//!
//! All components share one [`GuardConfig`]; every default is documented on its field.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tenant_guard::breaker::CircuitBreaker;
//! use tenant_guard::cache::MemoryCache;
//! use tenant_guard::provider::{Attributes, IdentityProvider, ResilientIdentity, Session, User};
//! use tenant_guard::recovery::Navigator;
//! use tenant_guard::resilient::ResilientCaller;
//! use tenant_guard::resolve::{IdentityResolver, IdentitySource};
//! use tenant_guard::{GuardConfig, ProviderError};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Directory;
//!
//! impl IdentityProvider for Directory {
//!     async fn get_current_user(&self) -> Result<User, ProviderError> {
//!         Ok(User::new("alice", "user-1"))
//!     }
//!
//!     async fn fetch_attributes(&self) -> Result<Attributes, ProviderError> {
//!         Ok(Attributes::from([(
//!             "custom:tenantId".to_string(),
//!             "5b1c2d3e-4f50-4a61-9b72-8c9d0e1f2a3b".to_string(),
//!         )]))
//!     }
//!
//!     async fn fetch_session(&self, _force_refresh: bool) -> Result<Session, ProviderError> {
//!         Ok(Session::new("access-token", None))
//!     }
//! }
//!
//! struct Browser;
//!
//! impl Navigator for Browser {
//!     fn current_location(&self) -> String {
//!         "/login".to_string()
//!     }
//!
//!     fn navigate(&self, _path: &str) {}
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let config = GuardConfig::default();
//! let caller = ResilientCaller::new(
//!     Arc::new(CircuitBreaker::new(config.breaker.clone())),
//!     Arc::new(MemoryCache::from_config(&config.cache)),
//!     config.retry.clone(),
//! );
//! let identity = ResilientIdentity::new(Arc::new(Directory), caller, &config);
//! let resolver = IdentityResolver::new(identity, Arc::new(Browser), &config);
//!
//! let resolved = resolver.resolve(&CancellationToken::new()).await.unwrap();
//! assert_eq!(resolved.source, IdentitySource::Provider);
//! assert_eq!(resolved.tenant_id.to_string(), "5b1c2d3e-4f50-4a61-9b72-8c9d0e1f2a3b");
//! # }
//! ```
//!
//! # Observability
//!
//! Every state change and every degraded answer is reported as a structured [`tracing`]
//! event named `tenant_guard.*`. The crate never installs a subscriber.
//!
//! # Features
//!
//! - `test-util`: enables the [`testing`] module with a scriptable provider and a recording
//!   navigator.

pub mod breaker;
pub mod cache;
pub mod config;
mod error;
pub mod provider;
pub mod recovery;
pub mod resilient;
pub mod resolve;
mod telemetry;

#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use config::GuardConfig;
pub use error::{CacheError, ConfigError, IdentityError, ProviderError};
pub use provider::IdentityProvider;
