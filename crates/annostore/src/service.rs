//! The storage façade: sessions, the exclusive pool and the snapshot cache in front of a driver.

use crate::cache::SharedAccessCache;
use crate::config::StoreConfig;
use crate::container::{Container, ContainerData};
use crate::driver::Driver;
use crate::error::{Stage, StoreError, StoreResult};
use crate::holder::ContainerHolder;
use crate::hooks::{
    Finding, Initializer, RepairHook, UpgradeHook, Validator, has_errors, log_findings,
};
use crate::key::{AccessKey, ProjectId};
use crate::metrics::StoreMetrics;
use crate::mode::{AccessMode, UpgradePolicy};
use crate::pool::{EvictorHandle, ExclusiveAccessPool, PooledHolder};
use crate::session::Session;
use private::Sealed;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, instrument, trace};

/// Raised by the type-system layer when the layer configuration of a project changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfigurationChanged {
    pub project: ProjectId,
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Validator findings. They are reported, not enforced.
    pub findings: Vec<Finding>,
}

impl WriteReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        has_errors(&self.findings)
    }
}

#[derive(Clone, Default)]
struct Hooks {
    repair: Option<Arc<dyn RepairHook>>,
    upgrade: Option<Arc<dyn UpgradeHook>>,
    validator: Option<Arc<dyn Validator>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("repair", &self.repair.is_some())
            .field("upgrade", &self.upgrade.is_some())
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct ServiceInner {
    driver: Arc<dyn Driver>,
    pool: ExclusiveAccessPool,
    cache: SharedAccessCache,
    config: StoreConfig,
    hooks: Hooks,
    _evictor: Option<EvictorHandle>,
}

/// Thread-safe handle to the storage core. Clones share the pool, cache and driver.
#[derive(Debug, Clone)]
pub struct StorageService {
    inner: Arc<ServiceInner>,
}

impl StorageService {
    pub fn builder() -> StorageServiceBuilder {
        StorageServiceBuilder::new()
    }

    /// Reads `key` with automatic upgrade and no initializer.
    pub fn read(&self, key: &AccessKey, mode: AccessMode) -> StoreResult<Container> {
        self.read_with(key, mode, UpgradePolicy::Auto, None)
    }

    /// Reads `key`, creating it through `initializer` if nothing is persisted yet.
    pub fn read_or_init(
        &self,
        key: &AccessKey,
        mode: AccessMode,
        initializer: &dyn Initializer,
    ) -> StoreResult<Container> {
        self.read_with(key, mode, UpgradePolicy::Auto, Some(initializer))
    }

    /// Reads `key` in `mode`.
    ///
    /// A container already held by the current session under a mode that permits `mode` is
    /// returned without I/O. Otherwise:
    /// - [`AccessMode::ExclusiveWrite`] borrows the pool slot for the lifetime of the session
    ///   and loads the container if the slot is empty;
    /// - [`AccessMode::SharedReadOnly`] serves a read-only snapshot from the shared cache;
    /// - the unmanaged modes load directly and record nothing.
    ///
    /// # Errors
    /// - [`StoreError::NoActiveSession`] for managed modes outside a session.
    /// - [`StoreError::InvalidArgument`] for shared reads with [`UpgradePolicy::Skip`].
    /// - [`StoreError::BorrowTimeout`] if another thread holds the key for too long.
    /// - [`StoreError::NotFound`] if nothing is persisted and no initializer applies.
    /// - [`StoreError::Retrieval`] wrapping driver, repair and upgrade failures.
    #[instrument(skip(self, initializer), fields(key = %key, mode = %mode))]
    pub fn read_with(
        &self,
        key: &AccessKey,
        mode: AccessMode,
        policy: UpgradePolicy,
        initializer: Option<&dyn Initializer>,
    ) -> StoreResult<Container> {
        let held = Session::update_entry(key, |entry| {
            entry.mode.permits(mode).then(|| {
                entry.read_count += 1;
                entry.container.clone()
            })
        });
        if let Some(container) = held.flatten() {
            trace!("Served from session");
            return Ok(container);
        }

        match mode {
            AccessMode::ExclusiveWrite => self.read_exclusive(key, policy, initializer),
            AccessMode::SharedReadOnly => self.read_shared(key, policy, initializer),
            AccessMode::Unmanaged | AccessMode::UnmanagedNonInitializing => {
                let _slot = self.inner.pool.borrow(key)?;
                self.load(key, mode, policy, initializer)
            },
        }
    }

    fn read_exclusive(
        &self,
        key: &AccessKey,
        policy: UpgradePolicy,
        initializer: Option<&dyn Initializer>,
    ) -> StoreResult<Container> {
        let mode = AccessMode::ExclusiveWrite;
        Session::current()?;

        let mut lease = self.inner.pool.borrow(key)?;
        let container = if let Some(container) = lease.container() {
            trace!("Reusing pooled container");
            container.clone()
        } else {
            match self.load(key, mode, policy, initializer) {
                Ok(container) => {
                    lease.set_container(container.clone());
                    container
                },
                Err(e) => {
                    lease.record_failure(e.to_string());
                    return Err(e);
                },
            }
        };

        Session::add_leased(key.clone(), mode, container.clone(), Some(lease))?;
        Session::update_entry(key, |entry| entry.read_count += 1);
        Ok(container)
    }

    fn read_shared(
        &self,
        key: &AccessKey,
        policy: UpgradePolicy,
        initializer: Option<&dyn Initializer>,
    ) -> StoreResult<Container> {
        let mode = AccessMode::SharedReadOnly;
        if policy != UpgradePolicy::Auto {
            return Err(StoreError::InvalidArgument {
                message: "shared read-only access requires automatic upgrade".into(),
                context: Some(key.to_string().into()),
            });
        }
        Session::current()?;

        let holder = {
            let _slot = self.inner.pool.borrow(key)?;
            self.inner.cache.get(key, || {
                let loaded = self.load(key, mode, policy, initializer)?;
                let snapshot = Container::snapshot(key.clone(), loaded.to_data());
                Ok(ContainerHolder::with_container(key.clone(), snapshot))
            })?
        };
        let container = holder.container().cloned().ok_or_else(|| StoreError::Internal {
            message: "cached holder carries no container".into(),
            context: Some(key.to_string().into()),
        })?;

        Session::add(key.clone(), mode, container.clone())?;
        Session::update_entry(key, |entry| entry.read_count += 1);
        Ok(container)
    }

    /// Loads, checks and upgrades a container. The caller holds the pool slot.
    fn load(
        &self,
        key: &AccessKey,
        mode: AccessMode,
        policy: UpgradePolicy,
        initializer: Option<&dyn Initializer>,
    ) -> StoreResult<Container> {
        let data = self.fetch(key, mode, initializer)?;
        let data = self.check_integrity(key, mode, data)?;
        let container = Container::new(key.clone(), data);
        if policy == UpgradePolicy::Auto {
            self.run_upgrade(&container, key, mode)?;
        }
        Ok(container)
    }

    fn fetch(
        &self,
        key: &AccessKey,
        mode: AccessMode,
        initializer: Option<&dyn Initializer>,
    ) -> StoreResult<ContainerData> {
        let driver = &self.inner.driver;
        let at_load = |e: StoreError| e.at_stage(key, mode, Stage::Load);

        if driver.exists(key).map_err(at_load)? {
            debug!(%key, "Loading container from driver");
            return driver.read(key).map_err(at_load);
        }

        match initializer {
            Some(initializer) if mode.allows_initializer() => {
                debug!(%key, "Initializing new container");
                initializer.initialize(key).map_err(at_load)
            },
            _ => Err(StoreError::NotFound { key: key.clone() }),
        }
    }

    fn check_integrity(
        &self,
        key: &AccessKey,
        mode: AccessMode,
        mut data: ContainerData,
    ) -> StoreResult<ContainerData> {
        let Some(repair) = &self.inner.hooks.repair else { return Ok(data) };

        let findings = repair.analyze(key, &data);
        log_findings(key, "analysis", &findings);
        if !has_errors(&findings) {
            return Ok(data);
        }
        if !self.inner.config.auto_repair {
            return Err(StoreError::Corrupt { key: key.clone(), findings }.at_stage(
                key,
                mode,
                Stage::Repair,
            ));
        }

        let repairs =
            repair.repair(key, &mut data).map_err(|e| e.at_stage(key, mode, Stage::Repair))?;
        log_findings(key, "repair", &repairs);

        let remaining = repair.analyze(key, &data);
        if has_errors(&remaining) {
            return Err(StoreError::Corrupt { key: key.clone(), findings: remaining }.at_stage(
                key,
                mode,
                Stage::Repair,
            ));
        }
        info!(%key, repairs = repairs.len(), "Container repaired");
        Ok(data)
    }

    /// Runs the upgrade hook in an isolated nested session that holds `container` for write.
    fn run_upgrade(
        &self,
        container: &Container,
        key: &AccessKey,
        mode: AccessMode,
    ) -> StoreResult<bool> {
        let Some(hook) = &self.inner.hooks.upgrade else { return Ok(false) };

        let _nested = Session::open_nested(true);
        Session::add(key.clone(), AccessMode::ExclusiveWrite, container.clone())?;
        let changed =
            hook.upgrade(container, key, mode).map_err(|e| e.at_stage(key, mode, Stage::Upgrade))?;
        if changed {
            debug!(%key, "Container upgraded");
        }
        Ok(changed)
    }

    /// Persists `container`.
    ///
    /// Within a session a key held for exclusive write is written through the tracked entry; a
    /// different instance than the tracked one supersedes it. Any other instance the session does
    /// not track gets exclusive access for the duration of the write, after which the pooled
    /// copy is dropped.
    ///
    /// # Errors
    /// [`StoreError::WriteNotPermitted`] for snapshots and containers held read-only.
    #[instrument(skip_all, fields(key = %container.key()))]
    pub fn write(&self, container: &Container) -> StoreResult<WriteReport> {
        let key = container.key();
        if container.is_read_only() {
            return Err(StoreError::WriteNotPermitted {
                key: key.clone(),
                reason: "shared snapshots cannot be persisted".into(),
            });
        }

        let entry = Session::managed_entry(key);
        let tracked = entry.as_ref().is_some_and(|entry| {
            entry.mode == AccessMode::ExclusiveWrite || entry.container.same_instance(container)
        });
        let Some(entry) = entry.filter(|_| tracked) else {
            let mut slot = self.inner.pool.borrow(key)?;
            let report = self.persist(key, container);
            slot.reset();
            return report;
        };

        if entry.mode != AccessMode::ExclusiveWrite {
            return Err(StoreError::WriteNotPermitted {
                key: key.clone(),
                reason: format!("held as {}", entry.mode).into(),
            });
        }
        if !entry.container.same_instance(container) {
            let (old, new) = (entry.container.id(), container.id());
            debug!(%old, %new, "Superseding tracked instance");
            Session::update_entry(key, |entry| {
                entry.container = container.clone();
                if let Some(lease) = entry.lease.as_mut() {
                    lease.set_container(container.clone());
                }
            });
        }

        let report = self.persist(key, container)?;
        Session::update_entry(key, |entry| entry.write_count += 1);
        Ok(report)
    }

    fn persist(&self, key: &AccessKey, container: &Container) -> StoreResult<WriteReport> {
        let at_persist =
            |e: StoreError| e.at_stage(key, AccessMode::ExclusiveWrite, Stage::Persist);
        let data = container.to_data();

        let findings = match &self.inner.hooks.validator {
            Some(validator) => validator.validate(key, &data).map_err(at_persist)?,
            None => Vec::new(),
        };
        log_findings(key, "validation", &findings);

        self.inner.driver.write(key, &data).map_err(at_persist)?;
        self.inner.cache.invalidate(key);
        debug!(%key, findings = findings.len(), "Container persisted");
        Ok(WriteReport { findings })
    }

    /// Borrows the pool slot for `key` unless the session already holds it for write.
    fn reserve(&self, key: &AccessKey) -> StoreResult<Option<PooledHolder>> {
        let held = Session::managed_entry(key)
            .is_some_and(|entry| entry.mode == AccessMode::ExclusiveWrite);
        if held { Ok(None) } else { self.inner.pool.borrow(key).map(Some) }
    }

    /// Deletes the persisted container and drops every in-memory copy of it.
    ///
    /// Returns `false` if nothing was persisted.
    #[instrument(skip(self), fields(key = %key))]
    pub fn delete(&self, key: &AccessKey) -> StoreResult<bool> {
        let slot = self.reserve(key)?;

        let deleted = self
            .inner
            .driver
            .delete(key)
            .map_err(|e| e.at_stage(key, AccessMode::ExclusiveWrite, Stage::Delete))?;
        self.inner.pool.mark_deleted(key);
        self.inner.cache.invalidate(key);
        drop(slot);
        Session::remove(key);

        info!(%key, deleted, "Container deleted");
        Ok(deleted)
    }

    /// Streams the persisted form of `key` into `sink`.
    #[instrument(skip(self, sink), fields(key = %key))]
    pub fn export(&self, key: &AccessKey, sink: &mut dyn Write) -> StoreResult<()> {
        let _slot = self.reserve(key)?;
        self.inner
            .driver
            .export(key, sink)
            .map_err(|e| e.at_stage(key, AccessMode::Unmanaged, Stage::Export))
    }

    /// Replaces the persisted form of `key` with the content of `source`.
    ///
    /// In-memory copies are dropped so the next read loads the imported content.
    #[instrument(skip(self, source), fields(key = %key))]
    pub fn import(&self, key: &AccessKey, source: &mut dyn Read) -> StoreResult<()> {
        let mut slot = self.reserve(key)?;

        self.inner
            .driver
            .import(key, source)
            .map_err(|e| e.at_stage(key, AccessMode::ExclusiveWrite, Stage::Import))?;

        if let Some(slot) = slot.as_mut() {
            slot.reset();
        }
        Session::update_entry(key, |entry| {
            if let Some(lease) = entry.lease.as_mut() {
                lease.reset();
            }
        });
        Session::remove(key);
        self.inner.cache.invalidate(key);
        info!(%key, "Container imported");
        Ok(())
    }

    /// Runs the upgrade hook on `key` and persists the result if it changed anything.
    ///
    /// Opens a session for the duration of the call if none is active.
    #[instrument(skip(self), fields(key = %key))]
    pub fn upgrade(&self, key: &AccessKey) -> StoreResult<bool> {
        let _session = if Session::is_active() { None } else { Some(Session::open()?) };

        let mode = AccessMode::ExclusiveWrite;
        let container = self.read_with(key, mode, UpgradePolicy::Skip, None)?;
        let changed = self.run_upgrade(&container, key, mode)?;
        if changed {
            let _report = self.write(&container)?;
        }
        Ok(changed)
    }

    /// Drops the in-memory copies of the project's containers built against the old type system.
    #[instrument(skip(self), fields(project = event.project))]
    pub fn on_layer_configuration_changed(&self, event: LayerConfigurationChanged) {
        let project = event.project;
        let marked = self.inner.pool.mark_schema_outdated(|key| key.belongs_to(project));
        let evicted = self.inner.cache.invalidate_project(project);
        info!(project, marked, evicted, "Layer configuration changed");
    }

    pub fn exists(&self, key: &AccessKey) -> StoreResult<bool> {
        self.inner
            .driver
            .exists(key)
            .map_err(|e| e.at_stage(key, AccessMode::Unmanaged, Stage::Load))
    }

    /// Modification time of the persisted container, if it exists.
    pub fn timestamp(&self, key: &AccessKey) -> StoreResult<Option<SystemTime>> {
        let metadata = self
            .inner
            .driver
            .metadata(key)
            .map_err(|e| e.at_stage(key, AccessMode::Unmanaged, Stage::Load))?;
        Ok(metadata.map(|m| m.timestamp))
    }

    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics::new(self.inner.cache.metrics(), self.inner.pool.stats())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }
}

#[derive(Debug, Default)]
pub struct NoDriver;
#[derive(Debug)]
pub struct WithDriver(Arc<dyn Driver>);

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoDriver {}
impl Sealed for WithDriver {}

#[allow(private_bounds)]
#[derive(Debug, Default)]
pub struct StorageServiceBuilder<S: Sealed = NoDriver> {
    state: S,
    config: StoreConfig,
    hooks: Hooks,
    background_eviction: Option<bool>,
}

#[allow(private_bounds)]
impl<S: Sealed> StorageServiceBuilder<S> {
    #[must_use = "Sets the pool and cache configuration"]
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use = "Installs the repair hook run on every load"]
    pub fn repair_hook(mut self, hook: impl RepairHook + 'static) -> Self {
        self.hooks.repair = Some(Arc::new(hook));
        self
    }

    #[must_use = "Installs the schema upgrade hook"]
    pub fn upgrade_hook(mut self, hook: impl UpgradeHook + 'static) -> Self {
        self.hooks.upgrade = Some(Arc::new(hook));
        self
    }

    #[must_use = "Installs the validator run before every write"]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.hooks.validator = Some(Arc::new(validator));
        self
    }

    #[must_use = "Sets whether idle pooled containers are swept on a background thread"]
    pub const fn background_eviction(mut self, enable: bool) -> Self {
        self.background_eviction = Some(enable);
        self
    }

    fn transition<N: Sealed>(self, state: N) -> StorageServiceBuilder<N> {
        StorageServiceBuilder {
            state,
            config: self.config,
            hooks: self.hooks,
            background_eviction: self.background_eviction,
        }
    }
}

impl StorageServiceBuilder<NoDriver> {
    #[must_use = "Creates a new service builder with default configuration"]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "Sets the persistence driver"]
    pub fn driver(self, driver: Arc<dyn Driver>) -> StorageServiceBuilder<WithDriver> {
        self.transition(WithDriver(driver))
    }
}

impl StorageServiceBuilder<WithDriver> {
    /// Validates the configuration and starts the service.
    ///
    /// Background eviction is on by default; it sweeps the pool every `idle_eviction_delay`.
    pub fn build(self) -> StoreResult<StorageService> {
        self.config.validate()?;
        let config = self.config;

        let pool = ExclusiveAccessPool::new(
            config.borrow_wait_timeout(),
            config.min_idle_container_time(),
        );
        let cache =
            SharedAccessCache::new(config.shared_cache_max_size, config.idle_eviction_delay());
        let evictor = if self.background_eviction.unwrap_or(true) {
            Some(pool.spawn_evictor(config.idle_eviction_delay())?)
        } else {
            None
        };

        info!(
            cache_size = config.shared_cache_max_size,
            borrow_timeout = ?config.borrow_wait_timeout(),
            auto_repair = config.auto_repair,
            driver = ?self.state.0,
            "Storage service started"
        );

        Ok(StorageService {
            inner: Arc::new(ServiceInner {
                driver: self.state.0,
                pool,
                cache,
                config,
                hooks: self.hooks,
                _evictor: evictor,
            }),
        })
    }
}
