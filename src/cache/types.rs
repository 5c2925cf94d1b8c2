//! Configuration and introspection types for the subscription cache.

use std::fmt;
use std::time::Duration;

/// Default delay between the last observer leaving and teardown.
pub const DEFAULT_TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for a [`SubscriptionCache`](super::SubscriptionCache).
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// How long an entry outlives its last observer.
    /// Default: 5s. Zero tears down synchronously on the last detach.
    pub teardown_grace: Duration,

    /// Capacity of the permission-error report channel.
    /// Default: 64. Reports beyond it are dropped.
    pub permission_error_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            teardown_grace: DEFAULT_TEARDOWN_GRACE,
            permission_error_buffer: 64,
        }
    }
}

impl CacheConfig {
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Tear entries down as soon as their last observer leaves.
    pub fn immediate_teardown(self) -> Self {
        self.with_teardown_grace(Duration::ZERO)
    }
}

/// Point-in-time counters for a cache instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live collection entries.
    pub collections: usize,
    /// Live document entries.
    pub documents: usize,
    /// Observers attached across all entries.
    pub observers: usize,
    /// Backend subscriptions started since creation.
    pub subscriptions_opened: usize,
    /// Backend subscriptions cancelled since creation.
    pub subscriptions_cancelled: usize,
}

/// Unique identifier for an attached observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}
