// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Well-known cache keys.

/// Most recently seen tenant id, from any source.
pub const TENANT_ID: &str = "tenant.id";

/// Tenant id previously confirmed valid; the reliable local fallback.
pub const TENANT_RELIABLE: &str = "tenant.reliable";

/// Last attribute map returned by the provider.
pub const USER_ATTRIBUTES: &str = "user.attributes";

/// Last user returned by the provider.
pub const USER_CURRENT: &str = "user.current";

/// Last session returned by the provider.
pub const AUTH_SESSION: &str = "auth.session";

/// Persisted count of provider failures observed by the recovery orchestrator.
pub const RECOVERY_ATTEMPTS: &str = "recovery.attempts";

/// Set while recovery mode is active. Holds `true` when recovery mode is entered and is
/// replaced by the recovered tenant id once one is resolved.
pub const RECOVERY_ACTIVATED: &str = "recovery.activated";

/// Prefix for last-known-good values kept by the resilient wrapper.
pub const FALLBACK_PREFIX: &str = "resilient.";

/// Key holding the last-known-good value for `operation`.
#[must_use]
pub fn fallback(operation: &str) -> String {
    format!("{FALLBACK_PREFIX}{operation}")
}
