//! Bounded cache of read-only container snapshots.

use crate::error::{StoreError, StoreResult};
use crate::holder::ContainerHolder;
use crate::key::{AccessKey, ProjectId};
use crate::metrics::CacheMetrics;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Occupancy, in percent of capacity, above which the cache warns.
pub const OCCUPANCY_WARN_PERCENT: u64 = 90;

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

/// Shared snapshot cache keyed by [`AccessKey`].
///
/// Entries are evicted by size and after being idle for the configured delay. Callers never
/// mutate cached containers; writes invalidate the entry instead.
#[derive(Debug, Clone)]
pub struct SharedAccessCache {
    cache: Cache<AccessKey, ContainerHolder>,
    capacity: u64,
    counters: Arc<Counters>,
    occupancy_warned: Arc<AtomicBool>,
}

impl SharedAccessCache {
    pub fn new(capacity: u64, idle_eviction: Duration) -> Self {
        let counters = Arc::new(Counters::default());
        let listener_counters = Arc::clone(&counters);

        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(idle_eviction)
            .eviction_listener(move |key, _holder, cause| {
                if matches!(cause, RemovalCause::Size | RemovalCause::Expired) {
                    listener_counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, ?cause, "Snapshot evicted");
                }
            })
            .build();

        Self { cache, capacity, counters, occupancy_warned: Arc::new(AtomicBool::new(false)) }
    }

    /// Returns the cached holder for `key`, running `loader` to populate it on a miss.
    ///
    /// Concurrent misses for the same key run a single loader. Failed loads are not cached and
    /// the loader's error is returned unchanged. A caller that waited on another caller's
    /// failed load runs its own loader.
    pub fn get(
        &self,
        key: &AccessKey,
        loader: impl FnOnce() -> StoreResult<ContainerHolder>,
    ) -> StoreResult<ContainerHolder> {
        let mut loader = Some(loader);
        let mut failure = None;
        let result = self.cache.try_get_with(key.clone(), || {
            let Some(load) = loader.take() else { return Err(()) };
            load().map_err(|e| {
                failure = Some(e);
            })
        });

        let c = &self.counters;
        let loaded = loader.is_none();
        match result {
            Ok(holder) if loaded => {
                c.misses.fetch_add(1, Ordering::Relaxed);
                c.load_successes.fetch_add(1, Ordering::Relaxed);
                self.check_occupancy();
                Ok(holder)
            },
            Ok(holder) => {
                c.hits.fetch_add(1, Ordering::Relaxed);
                Ok(holder)
            },
            Err(_) => {
                c.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(err) = failure {
                    c.load_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                let Some(load) = loader else {
                    return Err(StoreError::Internal {
                        message: "cache loader failed without an error".into(),
                        context: Some(key.to_string().into()),
                    });
                };
                match load() {
                    Ok(holder) => {
                        c.load_successes.fetch_add(1, Ordering::Relaxed);
                        self.cache.insert(key.clone(), holder.clone());
                        Ok(holder)
                    },
                    Err(err) => {
                        c.load_failures.fetch_add(1, Ordering::Relaxed);
                        Err(err)
                    },
                }
            },
        }
    }

    pub fn contains(&self, key: &AccessKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn invalidate(&self, key: &AccessKey) {
        self.cache.invalidate(key);
    }

    /// Removes every entry of `project`. Returns how many were removed.
    pub fn invalidate_project(&self, project: ProjectId) -> usize {
        let keys: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, _)| key.belongs_to(project))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.cache.invalidate(key.as_ref());
        }
        debug!(project, count = keys.len(), "Snapshots of project invalidated");
        keys.len()
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        self.check_occupancy();
    }

    /// Whether occupancy is above [`OCCUPANCY_WARN_PERCENT`] of the capacity.
    pub fn is_nearly_full(&self) -> bool {
        self.occupancy_warned.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.cache.run_pending_tasks();
        self.check_occupancy();
        let c = &self.counters;
        CacheMetrics {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            load_successes: c.load_successes.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            occupancy: self.cache.entry_count(),
            capacity: self.capacity,
        }
    }

    fn check_occupancy(&self) {
        let occupancy = self.cache.entry_count();
        let threshold = self.capacity.saturating_mul(OCCUPANCY_WARN_PERCENT) / 100;

        if occupancy > threshold {
            if !self.occupancy_warned.swap(true, Ordering::Relaxed) {
                warn!(occupancy, capacity = self.capacity, "Shared snapshot cache is nearly full");
            }
        } else {
            self.occupancy_warned.store(false, Ordering::Relaxed);
        }
    }
}
