use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use nodecore_sync::{LockManager, LockMode, LockRank};

fn uncontended_acquire_release(c: &mut Criterion) {
    let mgr = LockManager::new();
    c.bench_function("uncontended shared acquire/release", |b| {
        b.iter(|| {
            let guard = mgr.acquire("mempool", LockRank::Mempool.rank(), LockMode::Shared, Instant::now() + Duration::from_secs(1)).unwrap();
            drop(guard);
        });
    });
}

fn contended_exclusive_acquire(c: &mut Criterion) {
    let mgr = Arc::new(LockManager::new());
    c.bench_function("contended exclusive acquire across 4 threads", |b| {
        b.iter_batched(
            || mgr.clone(),
            |mgr| {
                let handles: Vec<_> = (0..4)
                    .map(|_| {
                        let mgr = mgr.clone();
                        std::thread::spawn(move || {
                            let guard = mgr.acquire("blockchain", LockRank::Blockchain.rank(), LockMode::Exclusive, Instant::now() + Duration::from_secs(1)).unwrap();
                            drop(guard);
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(lock_manager_benches, uncontended_acquire_release, contended_exclusive_acquire);
criterion_main!(lock_manager_benches);
