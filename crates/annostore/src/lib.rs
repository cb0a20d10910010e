//! Concurrent storage core for annotation containers.
//!
//! Containers are expensive to build and shared by many concurrent operations. The crate
//! guarantees that at most one writer holds a container per key while readers share immutable
//! snapshots.
//!
//! # Core Features
//!
//! - **Exclusive pooling**: [`ExclusiveAccessPool`] hands out one live holder per key and blocks
//!   other borrowers up to a timeout.
//! - **Snapshot caching**: [`SharedAccessCache`] keeps read-only snapshots, bounded by size and
//!   idle time, and counts hits, misses and evictions.
//! - **Sessions**: [`Session`] tracks per thread which containers the current unit of work owns,
//!   so repeated and nested reads of a key never deadlock against the pool.
//! - **Recovery**: optional [`RepairHook`], [`UpgradeHook`] and [`Validator`] run on load and
//!   write; failures carry the key, mode and stage in [`StoreError::Retrieval`].
//!
//! # Examples
//!
//! ```rust
//! use annostore::{
//!     AccessKey, AccessMode, ContainerData, MemoryDriver, Session, StorageService, StoreError,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), StoreError> {
//!     let driver = Arc::new(MemoryDriver::new());
//!     let service = StorageService::builder().driver(driver).build()?;
//!     let key = AccessKey::document(1, 42, "alice");
//!     let init = |_: &AccessKey| Ok::<_, StoreError>(ContainerData::new(1, b"empty".to_vec()));
//!
//!     let session = Session::open()?;
//!     let container = service.read_or_init(&key, AccessMode::ExclusiveWrite, &init)?;
//!     container.write()?.payload = b"annotated".to_vec();
//!     let _report = service.write(&container)?;
//!     session.close()?;
//!
//!     let _session = Session::open()?;
//!     let snapshot = service.read(&key, AccessMode::SharedReadOnly)?;
//!     assert_eq!(snapshot.read().payload, b"annotated");
//!     assert!(service.write(&snapshot).is_err());
//!     Ok(())
//! }
//! ```

mod cache;
mod config;
mod container;
mod driver;
mod error;
mod holder;
mod hooks;
mod key;
mod metrics;
mod mode;
mod pool;
mod service;
mod session;

pub use cache::{OCCUPANCY_WARN_PERCENT, SharedAccessCache};
pub use config::{ENV_PREFIX, StoreConfig};
pub use container::{Container, ContainerData, InstanceId};
pub use driver::{ContainerMetadata, Driver, MemoryDriver};
pub use error::{Stage, StoreError, StoreErrorExt, StoreResult};
pub use holder::ContainerHolder;
pub use hooks::{Finding, Initializer, RepairHook, Severity, UpgradeHook, Validator};
pub use key::{AccessKey, KeyTarget, ProjectId};
pub use metrics::{CacheMetrics, StoreMetrics};
pub use mode::{AccessMode, UpgradePolicy};
pub use pool::{
    EvictorHandle, ExclusiveAccessPool, POOL_GROWTH_WARN_THRESHOLD, POOL_GROWTH_WINDOW,
    PoolStats, PooledHolder,
};
pub use service::{
    LayerConfigurationChanged, NoDriver, StorageService, StorageServiceBuilder, WithDriver,
    WriteReport,
};
pub use session::{ManagedEntryView, OwnedContainer, Session, SessionGuard, SessionId};
