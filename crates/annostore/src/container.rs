//! The opaque annotation container and its shared handle.

use crate::error::{StoreError, StoreErrorExt, StoreResult};
use crate::key::AccessKey;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Stored content of a container. The payload is opaque to the storage core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerData {
    pub schema_version: u32,
    pub payload: Vec<u8>,
}

impl ContainerData {
    pub fn new(schema_version: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self { schema_version, payload: payload.into() }
    }

    /// Encodes the data into its persisted binary form.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        postcard::to_stdvec(self).context("Encoding container data")
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        postcard::from_bytes(bytes).context("Decoding container data")
    }
}

/// Process-unique identity of a loaded container instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct ContainerInner {
    id: InstanceId,
    key: AccessKey,
    read_only: bool,
    data: RwLock<ContainerData>,
}

/// A shared handle to a loaded container.
///
/// Clones refer to the same instance. Ownership and validity are tracked by the pool and the
/// session ledger, not by the handle itself. Handles obtained through
/// [`AccessMode::SharedReadOnly`](crate::AccessMode::SharedReadOnly) are snapshots: they refuse
/// [`Container::write`] and the service refuses to persist them.
#[derive(Debug, Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Creates a fresh, writable instance for `key`.
    pub fn new(key: AccessKey, data: ContainerData) -> Self {
        Self::build(key, data, false)
    }

    pub(crate) fn snapshot(key: AccessKey, data: ContainerData) -> Self {
        Self::build(key, data, true)
    }

    fn build(key: AccessKey, data: ContainerData, read_only: bool) -> Self {
        let id = InstanceId(NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed));
        Self { inner: Arc::new(ContainerInner { id, key, read_only, data: RwLock::new(data) }) }
    }

    pub fn id(&self) -> InstanceId {
        self.inner.id
    }

    pub fn key(&self) -> &AccessKey {
        &self.inner.key
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ContainerData> {
        self.inner.data.read()
    }

    /// Locks the container for mutation.
    ///
    /// # Errors
    /// Returns [`StoreError::WriteNotPermitted`] for shared read-only snapshots.
    pub fn write(&self) -> StoreResult<RwLockWriteGuard<'_, ContainerData>> {
        if self.inner.read_only {
            return Err(StoreError::WriteNotPermitted {
                key: self.inner.key.clone(),
                reason: "shared snapshots are immutable".into(),
            });
        }
        Ok(self.inner.data.write())
    }

    /// Copies the current content out of the container.
    pub fn to_data(&self) -> ContainerData {
        self.inner.data.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_identity_and_content() {
        let key = AccessKey::document(1, 1, "alice");
        let a = Container::new(key.clone(), ContainerData::new(1, b"x".to_vec()));
        let b = a.clone();
        let c = Container::new(key, ContainerData::new(1, b"x".to_vec()));

        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
        assert_ne!(a.id(), c.id());

        a.write().unwrap().payload.push(b'y');
        assert_eq!(b.read().payload, b"xy");
    }

    #[test]
    fn test_snapshot_refuses_mutation() {
        let key = AccessKey::document(1, 1, "bob");
        let snapshot = Container::snapshot(key, ContainerData::default());
        assert!(snapshot.is_read_only());
        assert!(matches!(snapshot.write(), Err(StoreError::WriteNotPermitted { .. })));
    }

    #[test]
    fn test_data_codec_roundtrip() {
        let data = ContainerData::new(3, vec![0, 1, 2, 255]);
        let bytes = data.encode().unwrap();
        assert_eq!(ContainerData::decode(&bytes).unwrap(), data);
        assert!(ContainerData::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
