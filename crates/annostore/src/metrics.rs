//! Read-only counters for operational monitoring.

use crate::pool::PoolStats;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    /// Entries removed by the size or idle bound. Invalidations are not counted.
    pub evictions: u64,
    pub occupancy: u64,
    pub capacity: u64,
}

impl CacheMetrics {
    /// Fraction of lookups served without running a loader, or `0.0` before the first lookup.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreMetrics {
    pub cache: CacheMetrics,
    pub pool_slots: usize,
    pub pool_borrowed: usize,
    pub pool_idle: usize,
    pub live_holders: usize,
}

impl StoreMetrics {
    pub(crate) const fn new(cache: CacheMetrics, pool: PoolStats) -> Self {
        Self {
            cache,
            pool_slots: pool.slots,
            pool_borrowed: pool.borrowed,
            pool_idle: pool.idle,
            live_holders: pool.live_holders,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        assert!(CacheMetrics::default().hit_rate().abs() < f64::EPSILON);
        let metrics = CacheMetrics { hits: 3, misses: 1, ..CacheMetrics::default() };
        assert!((metrics.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
