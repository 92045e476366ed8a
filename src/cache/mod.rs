//! In-process stale-while-revalidate cache for aggregate-view reads.
//!
//! Entries are keyed by opaque strings (by convention `<view name>:<id>`) so
//! that a broadcast naming a refreshed view can evict everything derived from
//! it with a single prefix scan.

mod metrics;
mod store;

pub use metrics::{CacheStats, KeyMetrics};
pub use store::MetricsCache;

use std::time::Duration;

/// Freshness windows for a single `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    /// Hard expiry, measured from when the entry was fetched.
    pub ttl: Duration,
    /// Age after which the entry is served stale and refreshed in the background.
    /// Clamped to `ttl`.
    pub stale_time: Duration,
}

impl CacheOptions {
    pub fn new(ttl: Duration, stale_time: Duration) -> Self {
        Self { ttl, stale_time }
    }

    pub(crate) fn effective_stale_time(&self) -> Duration {
        self.stale_time.min(self.ttl)
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            stale_time: Duration::from_secs(5 * 60),
        }
    }
}

/// Instance-wide settings for a [`MetricsCache`].
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Options applied by callers that do not pass their own.
    pub default_options: CacheOptions,
    /// First delay applied after a failed background refresh.
    pub refresh_backoff: Duration,
    /// Upper bound for the doubling refresh backoff.
    pub max_refresh_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_options: CacheOptions::default(),
            refresh_backoff: Duration::from_secs(1),
            max_refresh_backoff: Duration::from_secs(60),
        }
    }
}
