//! Filesystem persistence for the annostore storage core.
//!
//! [`FsDriver`] implements [`annostore::Driver`] on top of a sandboxed directory tree.
//!
//! # Core Features
//!
//! - **Sandbox Security**: key components are escaped into single path segments and every
//!   resolved path is checked against the canonical root.
//! - **Atomic Writes**: unique temp file, `fsync`, then `rename` over the target.
//! - **Transparent Compression**: optional LZ4 block compression, invisible to the core.
//! - **Sharding**: `<project>/<shard>/<shard>/` directories keep folders small.
//! - **Self-Healing**: temporary files orphaned by crashes are removed when the driver opens.
//!
//! # Examples
//!
//! ```rust
//! use annostore::{AccessKey, AccessMode, ContainerData, Session, StorageService, StoreError};
//! use annostore_fs::FsDriver;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), StoreError> {
//!     # let tmp = tempfile::tempdir().unwrap();
//!     # let root = tmp.path().join("data");
//!     let driver = FsDriver::builder().root(&root).open()?;
//!     let service = StorageService::builder().driver(Arc::new(driver)).build()?;
//!
//!     let key = AccessKey::document(1, 42, "alice");
//!     let init = |_: &AccessKey| Ok::<_, StoreError>(ContainerData::new(1, Vec::new()));
//!
//!     let session = Session::open()?;
//!     let container = service.read_or_init(&key, AccessMode::ExclusiveWrite, &init)?;
//!     container.write()?.payload = b"on disk".to_vec();
//!     service.write(&container)?;
//!     session.close()?;
//!
//!     assert!(service.exists(&key)?);
//!     Ok(())
//! }
//! ```

mod builder;
mod engine;
mod maintenance;
mod security;

pub use builder::{DEFAULT_STALE_TMP_AGE, FsDriverBuilder, NoRoot, WithRoot};
pub use engine::{Compression, FsDriver};
pub use maintenance::PurgeReport;
