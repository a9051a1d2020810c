// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;
use std::time::Duration;

use tokio::time::Instant;

use super::NetworkStatus;
use crate::resolve::TenantId;

/// Phase of the recovery state machine.
///
/// ```text
/// Normal --(unhealthy signal)--> RecoveryMode --(redirect issued)--> Redirecting --(safety net)--> Normal
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    /// Identity is healthy.
    #[default]
    Normal,
    /// An unhealthy signal was observed and degraded identity is in use.
    RecoveryMode,
    /// A recovery navigation was issued and its in-flight flag is still held.
    Redirecting,
}

impl Display for RecoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::RecoveryMode => "recovery_mode",
            Self::Redirecting => "redirecting",
        })
    }
}

/// Observable snapshot of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct RecoveryState {
    /// Current phase.
    pub phase: RecoveryPhase,
    /// Whether the orchestrator is mounted.
    pub mounted: bool,
    /// Mirror of the persisted failed-attempt counter.
    pub attempts: u32,
    /// Whether a recovery check is running.
    pub is_loading: bool,
    /// The tenant id found by the latest recovery, if any.
    pub recovered_tenant: Option<TenantId>,
    /// Whether an explicit "provider unreliable" signal is pending.
    pub provider_unreliable: bool,
    /// Latest connectivity quality seen on the network feed.
    pub network: NetworkStatus,
    /// When the latest check started.
    pub last_check_at: Option<Instant>,
}

impl RecoveryState {
    /// Returns `true` outside the [`Normal`][RecoveryPhase::Normal] phase.
    #[must_use]
    pub fn is_recovery_mode(&self) -> bool {
        self.phase != RecoveryPhase::Normal
    }
}

/// Why a recovery navigation was or was not issued.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RedirectOutcome {
    /// Navigation to `destination` was issued.
    Navigated {
        /// The path navigated to.
        destination: String,
    },
    /// Automatic redirects are disabled.
    AutoRedirectDisabled,
    /// The current location already is the destination.
    AlreadyAtDestination,
    /// Another redirect holds the redirect flag.
    InFlight,
    /// No tenant id could be resolved to build a destination.
    NoTenant,
}

/// Result of a recovery check.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecoveryOutcome {
    /// The orchestrator is not mounted.
    NotMounted,
    /// A check ran too recently.
    CoolingDown {
        /// Time until the next check is allowed.
        retry_after: Duration,
    },
    /// Another check is running.
    CheckInFlight,
    /// No recovery is needed.
    Healthy,
    /// Recovery mode is active.
    Recovering {
        /// The resolved tenant id, if any.
        tenant_id: Option<TenantId>,
        /// What happened to the recovery navigation.
        redirect: RedirectOutcome,
    },
    /// The orchestrator was unmounted while the check was running.
    Cancelled,
}
