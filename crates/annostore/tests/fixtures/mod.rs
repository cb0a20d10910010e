use annostore::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const CURRENT_SCHEMA: u32 = 2;
pub const BROKEN_PREFIX: &[u8] = b"BROKEN:";

#[must_use]
pub fn alice() -> AccessKey {
    AccessKey::document(1, 42, "alice")
}

/// Creates an in-memory driver holding one container.
/// # Panics
/// * If the seed cannot be encoded.
#[must_use]
pub fn seeded(key: &AccessKey, schema_version: u32, payload: &[u8]) -> Arc<MemoryDriver> {
    let driver = Arc::new(MemoryDriver::new());
    driver
        .insert(key.clone(), &ContainerData::new(schema_version, payload.to_vec()))
        .expect("Seeding failed");
    driver
}

#[must_use]
pub fn config() -> StoreConfig {
    StoreConfig::new().with_borrow_wait_timeout(Duration::from_secs(5))
}

/// Builds a service without hooks and without the background evictor.
/// # Panics
/// * If the service cannot be built.
#[must_use]
pub fn service(driver: &Arc<MemoryDriver>) -> StorageService {
    builder(driver).build().expect("Service setup failed")
}

#[must_use]
pub fn builder(driver: &Arc<MemoryDriver>) -> StorageServiceBuilder<WithDriver> {
    StorageService::builder().driver(driver.clone()).config(config()).background_eviction(false)
}

#[must_use]
pub fn payload(container: &Container) -> Vec<u8> {
    container.read().payload.clone()
}

#[must_use]
pub fn init_with(payload: &'static [u8]) -> impl Fn(&AccessKey) -> StoreResult<ContainerData> {
    move |_| Ok(ContainerData::new(CURRENT_SCHEMA, payload.to_vec()))
}

/// Bumps containers to [`CURRENT_SCHEMA`], appending a marker to the payload.
#[derive(Debug, Clone, Default)]
pub struct SchemaUpgrader {
    pub calls: Arc<AtomicUsize>,
}

impl SchemaUpgrader {
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UpgradeHook for SchemaUpgrader {
    fn upgrade(
        &self,
        container: &Container,
        _key: &AccessKey,
        _mode: AccessMode,
    ) -> StoreResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut data = container.write()?;
        if data.schema_version >= CURRENT_SCHEMA {
            return Ok(false);
        }
        data.schema_version = CURRENT_SCHEMA;
        data.payload.extend_from_slice(b"+v2");
        Ok(true)
    }
}

/// Flags payloads starting with [`BROKEN_PREFIX`] and repairs them by stripping it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixRepair;

impl RepairHook for PrefixRepair {
    fn analyze(&self, _key: &AccessKey, data: &ContainerData) -> Vec<Finding> {
        if data.payload.starts_with(BROKEN_PREFIX) {
            vec![Finding::new(Severity::Error, "payload carries a broken marker")]
        } else {
            Vec::new()
        }
    }

    fn repair(&self, _key: &AccessKey, data: &mut ContainerData) -> StoreResult<Vec<Finding>> {
        data.payload.drain(..BROKEN_PREFIX.len());
        Ok(vec![Finding::new(Severity::Info, "broken marker removed")])
    }
}

/// Warns about empty payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyPayloadValidator;

impl Validator for EmptyPayloadValidator {
    fn validate(&self, _key: &AccessKey, data: &ContainerData) -> StoreResult<Vec<Finding>> {
        if data.payload.is_empty() {
            Ok(vec![Finding::new(Severity::Warning, "empty payload")])
        } else {
            Ok(Vec::new())
        }
    }
}
