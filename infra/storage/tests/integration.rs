use annostore::{
    AccessKey, AccessMode, ContainerData, Driver, Session, StorageService, StoreConfig, StoreError,
};
use annostore_fs::*;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open(temp: &TempDir, compression: Compression) -> FsDriver {
    FsDriver::builder().root(temp.path()).compression(compression).open().unwrap()
}

#[test]
fn test_write_read_roundtrip_uncompressed() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(1, 42, "alice");
    let data = ContainerData::new(3, b"hello world".to_vec());

    driver.write(&key, &data).unwrap();

    assert!(driver.exists(&key).unwrap());
    assert_eq!(driver.read(&key).unwrap(), data);
    let meta = driver.metadata(&key).unwrap().unwrap();
    assert!(meta.size > 0);
}

#[test]
fn test_write_read_roundtrip_compressed() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::Lz4);
    let key = AccessKey::special_purpose(1, "curation", "bob");
    let data = ContainerData::new(1, vec![1u8; 4096]);

    driver.write(&key, &data).unwrap();

    assert_eq!(driver.read(&key).unwrap(), data);
    assert!(driver.metadata(&key).unwrap().unwrap().size < 4096);
}

#[test]
fn test_layout_is_sharded_below_project() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(7, 3, "alice");

    let path = driver.resolve(&key).unwrap();
    let relative = path.strip_prefix(driver.root()).unwrap();

    assert_eq!(relative.components().count(), 4);
    assert!(relative.starts_with("7"));
    assert!(path.to_string_lossy().ends_with("doc-3@alice.cas"));
}

#[test]
fn test_hostile_user_names_stay_in_sandbox() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(1, 1, "../../etc/passwd");

    driver.write(&key, &ContainerData::new(1, b"x".to_vec())).unwrap();

    let path = driver.resolve(&key).unwrap();
    assert!(path.starts_with(driver.root()));
    assert_eq!(path.strip_prefix(driver.root()).unwrap().components().count(), 4);
}

#[test]
fn test_overwrite_replaces_content() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(1, 1, "alice");

    driver.write(&key, &ContainerData::new(1, b"first".to_vec())).unwrap();
    driver.write(&key, &ContainerData::new(2, b"second".to_vec())).unwrap();

    assert_eq!(driver.read(&key).unwrap(), ContainerData::new(2, b"second".to_vec()));
    let shard = driver.resolve(&key).unwrap().parent().unwrap().to_path_buf();
    assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1, "no temp file left behind");
}

#[test]
fn test_missing_containers() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(1, 404, "alice");

    assert!(!driver.exists(&key).unwrap());
    assert!(matches!(driver.read(&key), Err(StoreError::NotFound { .. })));
    assert!(driver.metadata(&key).unwrap().is_none());
    assert!(!driver.delete(&key).unwrap());
    assert!(matches!(driver.export(&key, &mut Vec::new()), Err(StoreError::NotFound { .. })));
}

#[test]
fn test_delete_removes_file() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(1, 5, "alice");
    driver.write(&key, &ContainerData::new(1, b"x".to_vec())).unwrap();

    assert!(driver.delete(&key).unwrap());

    assert!(!driver.exists(&key).unwrap());
    assert!(!driver.resolve(&key).unwrap().exists());
}

#[test]
fn test_export_import_across_compression_settings() {
    let plain_dir = TempDir::new().unwrap();
    let packed_dir = TempDir::new().unwrap();
    let plain = open(&plain_dir, Compression::None);
    let packed = open(&packed_dir, Compression::Lz4);
    let from = AccessKey::document(1, 9, "alice");
    let to = AccessKey::document(1, 9, "bob");
    let data = ContainerData::new(2, vec![5u8; 1024]);
    packed.write(&from, &data).unwrap();

    let mut exported = Vec::new();
    packed.export(&from, &mut exported).unwrap();
    plain.import(&to, &mut exported.as_slice()).unwrap();

    assert_eq!(plain.read(&to).unwrap(), data);
    assert_eq!(ContainerData::decode(&exported).unwrap(), data);
}

#[test]
fn test_import_rejects_garbage() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::None);
    let key = AccessKey::document(1, 1, "alice");

    let err = driver.import(&key, &mut [0xFFu8; 8].as_slice()).unwrap_err();

    assert!(matches!(err, StoreError::Codec { .. }));
    assert!(!driver.exists(&key).unwrap());
}

#[test]
fn test_damaged_lz4_file_is_driver_error() {
    let temp = TempDir::new().unwrap();
    let driver = open(&temp, Compression::Lz4);
    let key = AccessKey::document(1, 1, "alice");
    driver.write(&key, &ContainerData::new(1, b"x".to_vec())).unwrap();
    std::fs::write(driver.resolve(&key).unwrap(), [0xFF, 0xFF]).unwrap();

    assert!(matches!(driver.read(&key), Err(StoreError::Driver { .. })));
}

#[test]
fn test_open_purges_abandoned_temp_files() {
    let temp = TempDir::new().unwrap();
    let key = AccessKey::document(1, 1, "alice");
    let orphan = {
        let driver = open(&temp, Compression::None);
        driver.write(&key, &ContainerData::new(1, b"x".to_vec())).unwrap();
        let target = driver.resolve(&key).unwrap();
        let orphan = target.with_file_name("doc-1@alice.cas.annotmp.1.1");
        std::fs::write(&orphan, b"half").unwrap();
        orphan
    };

    let driver =
        FsDriver::builder().root(temp.path()).stale_tmp_age(Duration::ZERO).open().unwrap();

    assert!(!orphan.exists());
    assert!(driver.exists(&key).unwrap());
}

#[test]
fn test_open_without_create_requires_root() {
    let temp = TempDir::new().unwrap();
    let missing = temp.path().join("absent");

    let result = FsDriver::builder().root(&missing).create(false).open();

    assert!(matches!(result, Err(StoreError::Io { .. })));
}

#[test]
fn test_service_persists_through_driver_restart() {
    let temp = TempDir::new().unwrap();
    let key = AccessKey::document(3, 11, "alice");
    let config = StoreConfig::new().with_borrow_wait_timeout(Duration::from_secs(5));
    let init = |_: &AccessKey| Ok::<_, StoreError>(ContainerData::new(1, Vec::new()));

    {
        let driver = Arc::new(open(&temp, Compression::Lz4));
        let service = StorageService::builder()
            .driver(driver)
            .config(config.clone())
            .background_eviction(false)
            .build()
            .unwrap();
        let session = Session::open().unwrap();
        let container = service.read_or_init(&key, AccessMode::ExclusiveWrite, &init).unwrap();
        container.write().unwrap().payload = b"persisted".to_vec();
        service.write(&container).unwrap();
        session.close().unwrap();
    }

    let driver = Arc::new(open(&temp, Compression::Lz4));
    let service = StorageService::builder()
        .driver(driver)
        .config(config)
        .background_eviction(false)
        .build()
        .unwrap();
    let _session = Session::open().unwrap();
    let snapshot = service.read(&key, AccessMode::SharedReadOnly).unwrap();
    assert_eq!(snapshot.read().payload, b"persisted");
    assert!(service.timestamp(&key).unwrap().is_some());
}
