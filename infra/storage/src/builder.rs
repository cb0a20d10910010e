use crate::engine::{Compression, FsDriver, FsDriverInner};
use annostore::{StoreErrorExt, StoreResult};
use private::Sealed;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tracing::info;

/// Temporary files younger than this are assumed to belong to a write still in flight.
pub const DEFAULT_STALE_TMP_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct FsConfig {
    compression: Compression,
    create: bool,
    purge_on_open: bool,
    stale_tmp_age: Duration,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            create: true,
            purge_on_open: true,
            stale_tmp_age: DEFAULT_STALE_TMP_AGE,
        }
    }
}

#[derive(Debug, Default)]
pub struct NoRoot;
#[derive(Debug)]
pub struct WithRoot(PathBuf);

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoRoot {}
impl Sealed for WithRoot {}

#[allow(private_bounds)]
#[derive(Debug, Default)]
pub struct FsDriverBuilder<S: Sealed = NoRoot> {
    state: S,
    config: FsConfig,
}

#[allow(private_bounds)]
impl<S: Sealed> FsDriverBuilder<S> {
    #[must_use = "Sets compression for container files"]
    pub const fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    #[must_use = "Sets whether the root directory should be created if it does not exist"]
    pub const fn create(mut self, enable: bool) -> Self {
        self.config.create = enable;
        self
    }

    #[must_use = "Sets whether stale temporary files are removed when the driver opens"]
    pub const fn purge_on_open(mut self, enable: bool) -> Self {
        self.config.purge_on_open = enable;
        self
    }

    #[must_use = "Sets the age after which temporary files count as abandoned"]
    pub const fn stale_tmp_age(mut self, age: Duration) -> Self {
        self.config.stale_tmp_age = age;
        self
    }

    fn transition<N: Sealed>(self, state: N) -> FsDriverBuilder<N> {
        FsDriverBuilder { state, config: self.config }
    }
}

impl FsDriverBuilder<NoRoot> {
    #[must_use = "Creates a new driver builder with default configuration"]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "Sets the root directory of the driver"]
    pub fn root(self, path: impl Into<PathBuf>) -> FsDriverBuilder<WithRoot> {
        self.transition(WithRoot(path.into()))
    }
}

impl FsDriverBuilder<WithRoot> {
    /// Consumes the configuration and opens the driver.
    ///
    /// Creates the root if `create(true)` was set, canonicalizes it so later sandbox checks
    /// compare physical paths, then sweeps temporary files abandoned by earlier crashes.
    /// Sweep failures are logged and never fail the open.
    ///
    /// # Errors
    ///
    /// Returns [`annostore::StoreError::Io`] if the root does not exist and `create` is false,
    /// or if it cannot be created or resolved.
    pub fn open(self) -> StoreResult<FsDriver> {
        let root = &self.state.0;

        if self.config.create {
            fs::create_dir_all(root)
                .context(format!("Failed to bootstrap storage root: {}", root.display()))?;
        }

        let canonical = fs::canonicalize(root)
            .context(format!("Failed to resolve storage root: {}", root.display()))?;
        info!(
            path = %canonical.display(),
            compression = ?self.config.compression,
            "Filesystem driver opened"
        );

        let driver = FsDriver {
            inner: Arc::new(FsDriverInner {
                root: canonical,
                compression: self.config.compression,
                stale_tmp_age: self.config.stale_tmp_age,
                tmp_counter: AtomicU64::new(1),
            }),
        };

        if self.config.purge_on_open {
            driver.purge_tmp();
        }

        Ok(driver)
    }
}
