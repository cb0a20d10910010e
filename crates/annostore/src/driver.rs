//! The persistence boundary of the storage core and an in-process implementation of it.

use crate::container::ContainerData;
use crate::error::{StoreErrorExt, StoreResult};
use crate::key::AccessKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;

/// What a driver knows about a persisted container without loading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub timestamp: SystemTime,
    pub size: u64,
}

/// Durable storage for containers.
///
/// Implementations must be safe to call from many threads; the storage core guarantees that
/// writes, deletes and imports for one key never overlap.
pub trait Driver: Send + Sync + fmt::Debug {
    fn exists(&self, key: &AccessKey) -> StoreResult<bool>;

    fn read(&self, key: &AccessKey) -> StoreResult<ContainerData>;

    fn write(&self, key: &AccessKey, data: &ContainerData) -> StoreResult<()>;

    /// Removes the persisted container. Returns `false` if there was nothing to delete.
    fn delete(&self, key: &AccessKey) -> StoreResult<bool>;

    fn metadata(&self, key: &AccessKey) -> StoreResult<Option<ContainerMetadata>>;

    /// Streams the persisted form of the container into `sink`.
    fn export(&self, key: &AccessKey, sink: &mut dyn Write) -> StoreResult<()>;

    /// Replaces the persisted form of the container with the content of `source`.
    fn import(&self, key: &AccessKey, source: &mut dyn Read) -> StoreResult<()>;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    timestamp: SystemTime,
}

/// A [`Driver`] keeping encoded containers in memory.
///
/// Counts physical reads and writes, which makes it convenient for observing cache behaviour.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    blobs: RwLock<HashMap<AccessKey, StoredBlob>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a container without counting it as a write.
    pub fn insert(&self, key: AccessKey, data: &ContainerData) -> StoreResult<()> {
        let bytes = data.encode()?;
        self.blobs.write().insert(key, StoredBlob { bytes, timestamp: SystemTime::now() });
        Ok(())
    }

    /// Replaces the stored bytes verbatim, e.g. to simulate a damaged file.
    pub fn insert_raw(&self, key: AccessKey, bytes: impl Into<Vec<u8>>) {
        self.blobs
            .write()
            .insert(key, StoredBlob { bytes: bytes.into(), timestamp: SystemTime::now() });
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }
}

impl Driver for MemoryDriver {
    fn exists(&self, key: &AccessKey) -> StoreResult<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    fn read(&self, key: &AccessKey) -> StoreResult<ContainerData> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let bytes = {
            let blobs = self.blobs.read();
            let Some(blob) = blobs.get(key) else {
                return Err(crate::StoreError::NotFound { key: key.clone() });
            };
            blob.bytes.clone()
        };
        ContainerData::decode(&bytes)
    }

    fn write(&self, key: &AccessKey, data: &ContainerData) -> StoreResult<()> {
        let bytes = data.encode()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blobs.write().insert(key.clone(), StoredBlob { bytes, timestamp: SystemTime::now() });
        debug!(%key, "Container stored in memory");
        Ok(())
    }

    fn delete(&self, key: &AccessKey) -> StoreResult<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn metadata(&self, key: &AccessKey) -> StoreResult<Option<ContainerMetadata>> {
        Ok(self.blobs.read().get(key).map(|blob| ContainerMetadata {
            timestamp: blob.timestamp,
            size: blob.bytes.len() as u64,
        }))
    }

    fn export(&self, key: &AccessKey, sink: &mut dyn Write) -> StoreResult<()> {
        let bytes = self
            .blobs
            .read()
            .get(key)
            .map(|blob| blob.bytes.clone())
            .ok_or_else(|| crate::StoreError::NotFound { key: key.clone() })?;
        sink.write_all(&bytes).context(format!("Exporting {key}"))
    }

    fn import(&self, key: &AccessKey, source: &mut dyn Read) -> StoreResult<()> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).context(format!("Importing {key}"))?;
        ContainerData::decode(&bytes)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blobs.write().insert(key.clone(), StoredBlob { bytes, timestamp: SystemTime::now() });
        Ok(())
    }
}
