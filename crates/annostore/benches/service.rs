use annostore::{
    AccessKey, AccessMode, ContainerData, MemoryDriver, Session, StorageService, StoreConfig,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn setup(documents: i64) -> (StorageService, Vec<AccessKey>) {
    let driver = Arc::new(MemoryDriver::new());
    let keys: Vec<_> = (0..documents).map(|doc| AccessKey::document(1, doc, "bench")).collect();
    for key in &keys {
        driver.insert(key.clone(), &ContainerData::new(1, vec![7u8; 4096])).unwrap();
    }
    let service = StorageService::builder()
        .driver(driver)
        .config(StoreConfig::new().with_borrow_wait_timeout(Duration::from_secs(5)))
        .background_eviction(false)
        .build()
        .unwrap();
    (service, keys)
}

// ============================================================================
// Benchmark: Shared reads served from the snapshot cache
// ============================================================================

fn bench_shared_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_read");

    for documents in [1, 64, 1024] {
        let (service, keys) = setup(documents);
        let mut next = 0;

        group.bench_with_input(BenchmarkId::new("cached", documents), &keys, |b, keys| {
            b.iter(|| {
                let key = &keys[next % keys.len()];
                next += 1;
                let _session = Session::open().unwrap();
                black_box(service.read(key, AccessMode::SharedReadOnly).unwrap());
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Exclusive read, mutate and write cycle
// ============================================================================

fn bench_exclusive_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("exclusive_cycle");
    let (service, keys) = setup(1);
    let key = &keys[0];

    group.bench_function("read_write_close", |b| {
        b.iter(|| {
            let session = Session::open().unwrap();
            let container = service.read(key, AccessMode::ExclusiveWrite).unwrap();
            container.write().unwrap().payload[0] ^= 1;
            black_box(service.write(&container).unwrap());
            session.close().unwrap();
        });
    });

    group.bench_function("session_hit", |b| {
        let _session = Session::open().unwrap();
        service.read(key, AccessMode::ExclusiveWrite).unwrap();
        b.iter(|| black_box(service.read(key, AccessMode::SharedReadOnly).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_shared_read, bench_exclusive_cycle);
criterion_main!(benches);
