// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Client-side navigation performed on behalf of recovery.
///
/// `navigate` is a push-style redirect that returns immediately; the orchestrator calls it
/// at most once per redirect cycle.
pub trait Navigator: Send + Sync + 'static {
    /// The current location, path plus query, for example `/3f6a.../dashboard?tab=2`.
    fn current_location(&self) -> String;

    /// Navigates to `path`.
    fn navigate(&self, path: &str);
}
