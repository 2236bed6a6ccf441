//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) null_hits: AtomicU64,
    pub(crate) singleflight_saved: AtomicU64,
    pub(crate) singleflight_timeout: AtomicU64,
    pub(crate) fail_open: AtomicU64,
    pub(crate) errors: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            null_cache_hits: self.null_hits.load(Ordering::Relaxed),
            singleflight_saved: self.singleflight_saved.load(Ordering::Relaxed),
            singleflight_timeout: self.singleflight_timeout.load(Ordering::Relaxed),
            fail_open_count: self.fail_open.load(Ordering::Relaxed),
            cache_errors: self.errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.null_hits,
            &self.singleflight_saved,
            &self.singleflight_timeout,
            &self.fail_open,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits on a cached "not found".
    pub null_cache_hits: u64,
    /// Misses served by joining another caller's load.
    pub singleflight_saved: u64,
    pub singleflight_timeout: u64,
    /// Reads that went to the store because the cache could not answer.
    pub fail_open_count: u64,
    pub cache_errors: u64,
}

impl CacheStatsSnapshot {
    /// Share of lookups answered from the cache, null hits included.
    pub fn hit_rate(&self) -> f64 {
        let answered = self.cache_hits + self.null_cache_hits;
        let total = answered + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            answered as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let counters = CacheCounters::default();
        CacheCounters::bump(&counters.hits);
        CacheCounters::bump(&counters.hits);
        CacheCounters::bump(&counters.null_hits);
        CacheCounters::bump(&counters.misses);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert!((snapshot.hit_rate() - 0.75).abs() < f64::EPSILON);

        counters.reset();
        assert_eq!(counters.snapshot(), CacheStatsSnapshot::default());
        assert_eq!(CacheStatsSnapshot::default().hit_rate(), 0.0);
    }
}
