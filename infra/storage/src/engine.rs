//! The filesystem [`Driver`] and its on-disk encoding.
//!
//! Every container is one file holding its `postcard` encoding, optionally LZ4-compressed.
//! Writes go through a unique temporary file that is synced and renamed over the target, so
//! a reader sees either the previous or the new content, never a torn file.

use crate::builder::{FsDriverBuilder, NoRoot};
use crate::maintenance::{self, PurgeReport, TMP_MARKER};
use crate::security;
use annostore::{
    AccessKey, ContainerData, ContainerMetadata, Driver, StoreError, StoreErrorExt, StoreResult,
};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Block compression applied to container files.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    fn compress(self, data: Vec<u8>) -> Vec<u8> {
        match self {
            Self::None => data,
            Self::Lz4 => lz4_flex::compress_prepend_size(&data),
        }
    }

    fn decompress(self, data: Vec<u8>) -> StoreResult<Vec<u8>> {
        match self {
            Self::None => Ok(data),
            Self::Lz4 => lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| StoreError::driver(e, "LZ4 decompression failed")),
        }
    }
}

#[derive(Debug)]
pub struct FsDriverInner {
    /// Canonicalized sandbox root.
    pub(crate) root: PathBuf,
    pub(crate) compression: Compression,
    pub(crate) stale_tmp_age: Duration,
    pub(crate) tmp_counter: AtomicU64,
}

/// A [`Driver`] persisting containers below a sandboxed root directory.
///
/// Files live at `<root>/<project>/<shard>/<shard>/<target>@<user>.cas`. Key components are
/// escaped into single path segments, and every resolved path is checked against the
/// canonical root so a symlinked shard directory cannot redirect writes out of the sandbox.
///
/// The handle is reference-counted and cheap to clone.
///
/// # Example
///
/// ```rust
/// use annostore::{AccessKey, ContainerData, Driver, StoreError};
/// use annostore_fs::{Compression, FsDriver};
///
/// fn main() -> Result<(), StoreError> {
///     # let tmp = tempfile::tempdir().unwrap();
///     # let root = tmp.path().join("data");
///     let driver = FsDriver::builder().root(&root).compression(Compression::Lz4).open()?;
///
///     let key = AccessKey::document(1, 42, "alice");
///     driver.write(&key, &ContainerData::new(1, b"annotations".to_vec()))?;
///     assert_eq!(driver.read(&key)?.payload, b"annotations");
///
///     println!("Stored at {}", driver.resolve(&key)?.display());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FsDriver {
    pub(crate) inner: Arc<FsDriverInner>,
}

impl Deref for FsDriver {
    type Target = FsDriverInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FsDriver {
    #[must_use = "The driver is not usable until you call .open()"]
    pub fn builder() -> FsDriverBuilder<NoRoot> {
        FsDriverBuilder::new()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Physical path of the file holding `key`, whether or not it exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if the path would leave the sandbox.
    pub fn resolve(&self, key: &AccessKey) -> StoreResult<PathBuf> {
        security::resolve_key(&self.root, key)
    }

    /// Removes temporary files left behind by interrupted writes.
    pub fn purge_tmp(&self) -> PurgeReport {
        maintenance::purge_tmp(&self.root, self.stale_tmp_age)
    }

    /// Reads and decompresses the file for `key`. `None` if it does not exist.
    fn read_encoded(&self, key: &AccessKey) -> StoreResult<Option<Vec<u8>>> {
        let resolved = self.resolve(key)?;
        match fs::read(&resolved) {
            Ok(data) => self.compression.decompress(data).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(format!("Read failed: {}", resolved.display())),
        }
    }

    /// Compresses `encoded` and atomically replaces the file for `key` with it.
    fn write_encoded(&self, key: &AccessKey, encoded: Vec<u8>) -> StoreResult<()> {
        let resolved = self.resolve(key)?;

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create shards for {}", resolved.display()))?;
        }

        let temp = unique_tmp_path(&resolved, &self.tmp_counter);
        let final_data = self.compression.compress(encoded);

        let written = write_synced(&temp, &final_data).and_then(|()| {
            fs::rename(&temp, &resolved).context(format!(
                "Atomic swap failed: {} -> {}",
                temp.display(),
                resolved.display()
            ))
        });
        if let Err(err) = written {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }

        if let Some(parent) = resolved.parent() {
            sync_dir(parent);
        }

        debug!(%key, path = %resolved.display(), "Container saved atomically");
        Ok(())
    }
}

impl Driver for FsDriver {
    fn exists(&self, key: &AccessKey) -> StoreResult<bool> {
        let resolved = self.resolve(key)?;
        resolved.try_exists().context(format!("Failed to probe {}", resolved.display()))
    }

    fn read(&self, key: &AccessKey) -> StoreResult<ContainerData> {
        let encoded =
            self.read_encoded(key)?.ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        ContainerData::decode(&encoded)
    }

    fn write(&self, key: &AccessKey, data: &ContainerData) -> StoreResult<()> {
        self.write_encoded(key, data.encode()?)
    }

    fn delete(&self, key: &AccessKey) -> StoreResult<bool> {
        let resolved = self.resolve(key)?;
        match fs::remove_file(&resolved) {
            Ok(()) => {
                debug!(%key, path = %resolved.display(), "Container file deleted");
                Ok(true)
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(format!("Failed to delete: {}", resolved.display())),
        }
    }

    fn metadata(&self, key: &AccessKey) -> StoreResult<Option<ContainerMetadata>> {
        let resolved = self.resolve(key)?;
        let meta = match fs::metadata(&resolved) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .context(format!("Failed to get metadata: {}", resolved.display()));
            },
        };
        let timestamp = meta.modified().context("File modification time unavailable")?;
        Ok(Some(ContainerMetadata { timestamp, size: meta.len() }))
    }

    /// Exports the uncompressed encoding, so drivers with different compression interoperate.
    fn export(&self, key: &AccessKey, sink: &mut dyn Write) -> StoreResult<()> {
        let encoded =
            self.read_encoded(key)?.ok_or_else(|| StoreError::NotFound { key: key.clone() })?;
        sink.write_all(&encoded).context(format!("Exporting {key}"))
    }

    fn import(&self, key: &AccessKey, source: &mut dyn Read) -> StoreResult<()> {
        let mut encoded = Vec::new();
        source.read_to_end(&mut encoded).context(format!("Importing {key}"))?;
        ContainerData::decode(&encoded)?;
        self.write_encoded(key, encoded)
    }
}

fn write_synced(path: &Path, data: &[u8]) -> StoreResult<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .context(format!("Temp creation failed: {}", path.display()))?;
    file.write_all(data).context("Write failed")?;
    file.sync_all().context("Hardware sync failed")
}

fn sync_dir(path: &Path) {
    match fs::File::open(path) {
        Ok(dir) => {
            if let Err(err) = dir.sync_all() {
                warn!(path = %path.display(), error = %err, "Directory sync failed");
            }
        },
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Directory open failed");
        },
    }
}

fn unique_tmp_path(target: &Path, counter: &AtomicU64) -> PathBuf {
    let counter = counter.fetch_add(1, Ordering::Relaxed);
    let file_name = target.file_name().and_then(|s| s.to_str()).unwrap_or("container");
    target.with_file_name(format!("{file_name}{TMP_MARKER}{}.{counter}", std::process::id()))
}
