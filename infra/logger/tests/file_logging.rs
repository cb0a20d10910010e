use annostore::{AccessKey, ContainerData, MemoryDriver, StorageService};
use annostore_logger::{LevelFilter, Logger};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn json_file_records_storage_events() -> Result<(), Box<dyn std::error::Error>> {
    let tmp_dir = tempdir()?;
    let log_dir = tmp_dir.path().join("logs");

    let logger = Logger::builder()
        .name("integration-file-logging")
        .console(false)
        .level(LevelFilter::WARN)
        .store_level(LevelFilter::INFO)
        .path(&log_dir)
        .json()
        .init()?;

    let key = AccessKey::document(1, 42, "alice");
    let driver = Arc::new(MemoryDriver::new());
    driver.insert(key.clone(), &ContainerData::new(1, b"seed".to_vec()))?;
    let service = StorageService::builder().driver(driver).background_eviction(false).build()?;
    assert!(service.delete(&key)?);
    tracing::info!("below the host level");

    std::thread::sleep(Duration::from_millis(30));
    logger.shutdown();

    let log_file = fs::read_dir(&log_dir)?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .expect("log file should be created");

    let contents = fs::read_to_string(&log_file)?;
    assert!(contents.contains("Container deleted"));
    assert!(contents.contains("\"target\":\"annostore::service\""));
    assert!(!contents.contains("below the host level"));
    Ok(())
}
