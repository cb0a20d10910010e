//! Keyed object pool handing out at most one live [`ContainerHolder`] per key.

use crate::error::{StoreError, StoreErrorExt, StoreResult};
use crate::holder::{ContainerHolder, HolderState};
use crate::key::AccessKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Slot growth within one [`POOL_GROWTH_WINDOW`] that is reported as a warning.
pub const POOL_GROWTH_WARN_THRESHOLD: usize = 500;
/// Length of the window over which pool growth is measured. The baseline resets each window.
pub const POOL_GROWTH_WINDOW: Duration = Duration::from_secs(60);

const REGISTRY_SWEEP_INTERVAL: usize = 256;

#[derive(Debug)]
struct IdleHolder {
    holder: ContainerHolder,
    since: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    idle: Option<IdleHolder>,
    borrowed: Option<Arc<HolderState>>,
    waiters: usize,
}

impl Slot {
    const fn is_unused(&self) -> bool {
        self.idle.is_none() && self.borrowed.is_none() && self.waiters == 0
    }
}

#[derive(Debug)]
struct GrowthMonitor {
    window_start: Instant,
    baseline: usize,
}

impl GrowthMonitor {
    fn new() -> Self {
        Self { window_start: Instant::now(), baseline: 0 }
    }

    /// Returns whether `size` crossed the growth threshold within the current window.
    fn observe(&mut self, size: usize) -> bool {
        if self.window_start.elapsed() >= POOL_GROWTH_WINDOW {
            self.window_start = Instant::now();
            self.baseline = size;
            false
        } else if size >= self.baseline + POOL_GROWTH_WARN_THRESHOLD {
            warn!(
                size,
                baseline = self.baseline,
                window = ?POOL_GROWTH_WINDOW,
                "Exclusive access pool is growing fast"
            );
            self.baseline = size;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct PoolState {
    slots: HashMap<AccessKey, Slot>,
    growth: GrowthMonitor,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
    returned: Condvar,
    registry: Mutex<Registry>,
    borrow_timeout: Duration,
    min_idle: Duration,
}

/// Non-owning record of every holder the pool created. Diagnostics only.
#[derive(Debug, Default)]
struct Registry {
    holders: Vec<Weak<HolderState>>,
    since_sweep: usize,
}

impl Registry {
    fn register(&mut self, state: &Arc<HolderState>) {
        self.holders.push(Arc::downgrade(state));
        self.since_sweep += 1;
        if self.since_sweep >= REGISTRY_SWEEP_INTERVAL {
            self.sweep();
        }
    }

    fn sweep(&mut self) {
        self.holders.retain(|weak| weak.strong_count() > 0);
        self.since_sweep = 0;
    }
}

/// Snapshot of the pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub slots: usize,
    pub borrowed: usize,
    pub idle: usize,
    pub live_holders: usize,
}

/// The exclusive access pool.
///
/// Borrowing a key while another borrower holds it blocks until the holder comes back or the
/// timeout expires. Holders are validated on borrow and on return: holders that were never
/// loaded, are deleted or carry an outdated schema are discarded so the next borrower loads a
/// fresh container.
#[derive(Debug, Clone)]
pub struct ExclusiveAccessPool {
    inner: Arc<PoolInner>,
}

impl ExclusiveAccessPool {
    pub fn new(borrow_timeout: Duration, min_idle: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots: HashMap::new(),
                    growth: GrowthMonitor::new(),
                }),
                returned: Condvar::new(),
                registry: Mutex::new(Registry::default()),
                borrow_timeout,
                min_idle,
            }),
        }
    }

    /// Borrows the holder for `key`, waiting up to the configured timeout.
    pub fn borrow(&self, key: &AccessKey) -> StoreResult<PooledHolder> {
        self.borrow_timeout(key, self.inner.borrow_timeout)
    }

    /// Borrows the holder for `key`, waiting at most `timeout` for the current borrower.
    ///
    /// # Errors
    /// Returns [`StoreError::BorrowTimeout`] if the holder is still borrowed when the timeout
    /// expires.
    pub fn borrow_timeout(&self, key: &AccessKey, timeout: Duration) -> StoreResult<PooledHolder> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.inner.state.lock();

        loop {
            let slot = state.slots.entry(key.clone()).or_default();
            if slot.borrowed.is_none() {
                let (holder, fresh) = match slot.idle.take() {
                    Some(idle) if idle.holder.is_valid() => (idle.holder, false),
                    Some(idle) => {
                        let reason = idle.holder.invalid_reason();
                        trace!(%key, reason, "Discarding idle holder");
                        (ContainerHolder::new(key.clone()), true)
                    },
                    None => (ContainerHolder::new(key.clone()), true),
                };
                slot.borrowed = Some(Arc::clone(holder.state()));

                let size = state.slots.len();
                state.growth.observe(size);
                drop(state);

                if fresh {
                    self.inner.registry.lock().register(holder.state());
                }
                trace!(%key, fresh, "Holder borrowed");
                return Ok(PooledHolder { pool: Arc::clone(&self.inner), holder });
            }

            slot.waiters += 1;
            let timed_out = self.inner.returned.wait_until(&mut state, deadline).timed_out();
            let still_borrowed = state.slots.get_mut(key).is_some_and(|slot| {
                slot.waiters -= 1;
                slot.borrowed.is_some()
            });

            if timed_out && still_borrowed {
                let waited = started.elapsed();
                debug!(%key, ?waited, "Borrow timed out");
                return Err(StoreError::BorrowTimeout { key: key.clone(), waited });
            }
        }
    }

    /// Drops idle holders unused for at least the configured minimum idle time.
    pub fn evict_idle(&self) -> usize {
        let min_idle = self.inner.min_idle;
        let mut evicted = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.slots.retain(|_, slot| {
                if slot.idle.as_ref().is_some_and(|idle| idle.since.elapsed() >= min_idle) {
                    evicted.extend(slot.idle.take());
                }
                !slot.is_unused()
            });
        }
        self.inner.registry.lock().sweep();

        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted idle holders");
        }
        evicted.len()
    }

    /// Runs [`ExclusiveAccessPool::evict_idle`] every `interval` on a background thread.
    ///
    /// The thread stops when the returned handle is dropped or the pool goes away.
    pub fn spawn_evictor(&self, interval: Duration) -> StoreResult<EvictorHandle> {
        if interval.is_zero() {
            return Err(StoreError::InvalidArgument {
                message: "evictor interval must be greater than zero".into(),
                context: None,
            });
        }
        let (stop, stopped) = mpsc::channel::<()>();
        let pool = Arc::downgrade(&self.inner);

        let thread = std::thread::Builder::new()
            .name("annostore-evictor".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {},
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(inner) = pool.upgrade() else { break };
                    Self { inner }.evict_idle();
                }
                trace!("Idle evictor stopped");
            })
            .context("Failed to spawn idle evictor")?;

        debug!(?interval, "Idle evictor started");
        Ok(EvictorHandle { stop: Some(stop), thread: Some(thread) })
    }

    /// Flags the holder of `key` as deleted, wherever it currently is.
    pub fn mark_deleted(&self, key: &AccessKey) -> bool {
        let dropped = {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.slots.get_mut(key) else { return false };
            if let Some(borrowed) = &slot.borrowed {
                borrowed.mark_deleted();
            }
            let dropped = slot.idle.take();
            if slot.is_unused() {
                state.slots.remove(key);
            }
            dropped
        };
        trace!(%key, idle = dropped.is_some(), "Holder marked deleted");
        true
    }

    /// Flags every holder whose key matches `predicate` as schema-outdated.
    pub fn mark_schema_outdated(&self, predicate: impl Fn(&AccessKey) -> bool) -> usize {
        let mut marked = 0;
        let mut dropped = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.slots.retain(|key, slot| {
                if !predicate(key) {
                    return true;
                }
                if let Some(borrowed) = &slot.borrowed {
                    borrowed.mark_schema_outdated();
                    marked += 1;
                }
                if let Some(idle) = slot.idle.take() {
                    dropped.push(idle);
                    marked += 1;
                }
                !slot.is_unused()
            });
        }
        debug!(marked, "Holders marked schema-outdated");
        marked
    }

    /// Number of holders created by this pool that are still alive anywhere.
    pub fn live_holders(&self) -> usize {
        let mut registry = self.inner.registry.lock();
        registry.sweep();
        registry.holders.len()
    }

    /// Keys of the live holders, for diagnostics. May contain duplicates while a discarded
    /// holder is still being dropped.
    pub fn live_keys(&self) -> Vec<AccessKey> {
        let registry = self.inner.registry.lock();
        registry
            .holders
            .iter()
            .filter_map(Weak::upgrade)
            .map(|state| state.key().clone())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let (slots, borrowed, idle) = {
            let state = self.inner.state.lock();
            let borrowed = state.slots.values().filter(|s| s.borrowed.is_some()).count();
            let idle = state.slots.values().filter(|s| s.idle.is_some()).count();
            (state.slots.len(), borrowed, idle)
        };
        PoolStats { slots, borrowed, idle, live_holders: self.live_holders() }
    }
}

impl PoolInner {
    fn give_back(&self, holder: ContainerHolder) {
        let key = holder.key().clone();
        let discarded = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(&key) else {
                warn!(%key, "Returned holder has no pool slot");
                return;
            };
            slot.borrowed = None;
            let discarded = if holder.is_valid() {
                slot.idle = Some(IdleHolder { holder, since: Instant::now() });
                None
            } else {
                Some(holder)
            };
            if slot.is_unused() {
                state.slots.remove(&key);
            }
            discarded
        };
        self.returned.notify_all();

        if let Some(holder) = discarded {
            match holder.failure() {
                Some(failure) => debug!(%key, failure, "Holder of failed load discarded"),
                None => trace!(%key, reason = holder.invalid_reason(), "Returned holder discarded"),
            }
        } else {
            trace!(%key, "Holder returned");
        }
    }
}

/// A borrowed holder. Dropping it returns the holder to the pool.
#[derive(Debug)]
pub struct PooledHolder {
    pool: Arc<PoolInner>,
    holder: ContainerHolder,
}

impl Deref for PooledHolder {
    type Target = ContainerHolder;

    fn deref(&self) -> &ContainerHolder {
        &self.holder
    }
}

impl DerefMut for PooledHolder {
    fn deref_mut(&mut self) -> &mut ContainerHolder {
        &mut self.holder
    }
}

impl Drop for PooledHolder {
    fn drop(&mut self) {
        self.pool.give_back(self.holder.take());
    }
}

/// Keeps the background idle evictor running. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct EvictorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for EvictorHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Idle evictor thread panicked");
        }
    }
}
