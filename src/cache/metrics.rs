//! Per-key counters and aggregate statistics.

use serde::Serialize;

/// Counters for a single cache key. Monotonic for the life of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetrics {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub invalidations: u64,
    pub errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Totals across every key the cache has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries currently stored.
    pub size: usize,
    /// Fetches currently in flight.
    pub pending_refreshes: usize,
    pub total_hits: u64,
    pub total_misses: u64,
    pub total_stale_hits: u64,
    pub total_invalidations: u64,
    pub total_errors: u64,
    /// `(hits + stale_hits) / (hits + stale_hits + misses)`, zero before any request.
    pub hit_rate: f64,
}

impl CacheStats {
    pub(crate) fn accumulate(&mut self, metrics: &KeyMetrics) {
        self.total_hits += metrics.hits;
        self.total_misses += metrics.misses;
        self.total_stale_hits += metrics.stale_hits;
        self.total_invalidations += metrics.invalidations;
        self.total_errors += metrics.errors;
    }

    pub(crate) fn finish(mut self) -> Self {
        let served = self.total_hits + self.total_stale_hits;
        let requests = served + self.total_misses;
        self.hit_rate = if requests > 0 {
            served as f64 / requests as f64
        } else {
            0.0
        };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_counts_stale_hits_as_served() {
        let mut stats = CacheStats::default();
        stats.accumulate(&KeyMetrics {
            hits: 2,
            misses: 1,
            stale_hits: 1,
            ..Default::default()
        });
        let stats = stats.finish();
        assert_eq!(stats.hit_rate, 0.75);
    }

    #[test]
    fn hit_rate_is_zero_without_requests() {
        let mut stats = CacheStats::default();
        stats.accumulate(&KeyMetrics {
            invalidations: 3,
            ..Default::default()
        });
        assert_eq!(stats.finish().hit_rate, 0.0);
    }

    #[test]
    fn key_metrics_serialize_camel_case() {
        let json = serde_json::to_value(KeyMetrics {
            stale_hits: 4,
            last_error: Some("boom".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["staleHits"], 4);
        assert_eq!(json["lastError"], "boom");
    }
}
