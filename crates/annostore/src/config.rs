use crate::error::{StoreError, StoreErrorExt, StoreResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Prefix of environment overrides, e.g. `ANNOSTORE__BORROW_WAIT_TIMEOUT_MS=5000`.
pub const ENV_PREFIX: &str = "ANNOSTORE";

/// Tuning of the exclusive pool and the shared snapshot cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of snapshots kept by the shared cache.
    pub shared_cache_max_size: u64,
    /// Idle time after which cached snapshots expire; also the interval of the pool sweep.
    pub idle_eviction_delay_ms: u64,
    /// Minimum time a pooled holder must sit idle before the sweep drops it.
    pub min_idle_container_time_ms: u64,
    /// Upper bound for waiting on another thread to return an exclusive holder.
    pub borrow_wait_timeout_ms: u64,
    /// Repair damaged containers on load instead of refusing them.
    pub auto_repair: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shared_cache_max_size: 20_000,
            idle_eviction_delay_ms: 300_000,
            min_idle_container_time_ms: 300_000,
            borrow_wait_timeout_ms: 180_000,
            auto_repair: false,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration from a file, overlaid with `ANNOSTORE__*` environment variables.
    ///
    /// Keys missing from both sources keep their defaults.
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] if the file is missing or malformed, and
    /// [`StoreError::InvalidArgument`] if the resulting values are unusable.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading storage configuration");

        let config: Self = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()
            .context("Failed to build storage config")?
            .try_deserialize()
            .context("Failed to deserialize storage config")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.shared_cache_max_size == 0 {
            return Err(StoreError::InvalidArgument {
                message: "shared_cache_max_size must be greater than zero".into(),
                context: None,
            });
        }
        if self.idle_eviction_delay_ms == 0 {
            return Err(StoreError::InvalidArgument {
                message: "idle_eviction_delay_ms must be greater than zero".into(),
                context: None,
            });
        }
        if self.borrow_wait_timeout_ms == 0 {
            return Err(StoreError::InvalidArgument {
                message: "borrow_wait_timeout_ms must be greater than zero".into(),
                context: None,
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_shared_cache_max_size(mut self, size: u64) -> Self {
        self.shared_cache_max_size = size;
        self
    }

    #[must_use]
    pub fn with_idle_eviction_delay(mut self, delay: Duration) -> Self {
        self.idle_eviction_delay_ms = as_millis(delay);
        self
    }

    #[must_use]
    pub fn with_min_idle_container_time(mut self, time: Duration) -> Self {
        self.min_idle_container_time_ms = as_millis(time);
        self
    }

    #[must_use]
    pub fn with_borrow_wait_timeout(mut self, timeout: Duration) -> Self {
        self.borrow_wait_timeout_ms = as_millis(timeout);
        self
    }

    #[must_use]
    pub const fn with_auto_repair(mut self, enabled: bool) -> Self {
        self.auto_repair = enabled;
        self
    }

    pub const fn idle_eviction_delay(&self) -> Duration {
        Duration::from_millis(self.idle_eviction_delay_ms)
    }

    pub const fn min_idle_container_time(&self) -> Duration {
        Duration::from_millis(self.min_idle_container_time_ms)
    }

    pub const fn borrow_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_wait_timeout_ms)
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder_methods() {
        let config = StoreConfig::new()
            .with_shared_cache_max_size(10)
            .with_idle_eviction_delay(Duration::from_secs(2))
            .with_min_idle_container_time(Duration::from_millis(1500))
            .with_borrow_wait_timeout(Duration::from_millis(250))
            .with_auto_repair(true);

        assert_eq!(config.shared_cache_max_size, 10);
        assert_eq!(config.idle_eviction_delay(), Duration::from_secs(2));
        assert_eq!(config.min_idle_container_time(), Duration::from_millis(1500));
        assert_eq!(config.borrow_wait_timeout(), Duration::from_millis(250));
        assert!(config.auto_repair);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = StoreConfig::new().with_shared_cache_max_size(0);
        assert!(matches!(config.validate(), Err(StoreError::InvalidArgument { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_idle_eviction_delay() {
        let config = StoreConfig::new().with_idle_eviction_delay(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("idle_eviction_delay_ms"));
    }

    #[test]
    fn test_load_from_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annostore.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "shared_cache_max_size = 64").unwrap();
        writeln!(file, "auto_repair = true").unwrap();
        drop(file);

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.shared_cache_max_size, 64);
        assert!(config.auto_repair);
        assert_eq!(config.borrow_wait_timeout_ms, StoreConfig::default().borrow_wait_timeout_ms);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = StoreConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, StoreError::Config { .. }));
    }
}
