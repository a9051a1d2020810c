// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 16;

/// Connectivity quality reported by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// No event has been observed yet.
    #[default]
    Unknown,
    /// The network works normally.
    Healthy,
    /// Requests succeed but slowly or intermittently.
    Degraded,
    /// No connectivity.
    Offline,
}

impl Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        })
    }
}

/// A connectivity change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// The new connectivity quality.
    pub quality: NetworkStatus,
    /// Host specific connection type, for example `wifi` or `4g`.
    pub kind: String,
}

impl NetworkEvent {
    /// Creates an event.
    #[must_use]
    pub fn new(quality: NetworkStatus, kind: impl Into<String>) -> Self {
        Self {
            quality,
            kind: kind.into(),
        }
    }
}

/// Fan-out of connectivity events from the host to every subscriber.
///
/// Subscribing returns a receiver; dropping the receiver unsubscribes. Slow subscribers
/// lose the oldest events rather than blocking the publisher.
#[derive(Debug, Clone)]
pub struct NetworkFeed {
    sender: broadcast::Sender<NetworkEvent>,
}

impl Default for NetworkFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkFeed {
    /// Creates a feed with the default buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a feed buffering up to `capacity` events per subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes `event` and returns the number of subscribers that will see it.
    pub fn publish(&self, event: NetworkEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribes to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
