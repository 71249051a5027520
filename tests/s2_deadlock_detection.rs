use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use nodecore_sync::{CoreError, LockManager, LockMode};

fn deadline_in(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

#[test]
fn two_threads_acquiring_in_reverse_order_detect_the_cycle_promptly() {
    let _ = env_logger::try_init();
    let mgr = Arc::new(LockManager::new());
    let barrier = Arc::new(Barrier::new(2));

    let mgr_a = mgr.clone();
    let barrier_a = barrier.clone();
    let a = std::thread::spawn(move || {
        let _l1 = mgr_a.acquire("L1", 1, LockMode::Exclusive, deadline_in(500)).unwrap();
        barrier_a.wait();
        std::thread::sleep(Duration::from_millis(20));
        mgr_a.acquire("L2", 2, LockMode::Exclusive, deadline_in(1000)).is_ok()
    });

    let mgr_b = mgr.clone();
    let barrier_b = barrier.clone();
    let b = std::thread::spawn(move || {
        let _l2 = mgr_b.acquire("L2", 2, LockMode::Exclusive, deadline_in(500)).unwrap();
        barrier_b.wait();
        let start = Instant::now();
        let result = mgr_b.acquire("L1", 1, LockMode::Exclusive, deadline_in(2000));
        (result, start.elapsed())
    });

    let (result_b, elapsed_b) = b.join().unwrap();
    assert!(matches!(result_b, Err(CoreError::DeadlockDetected { .. })));
    assert!(elapsed_b < Duration::from_millis(50), "deadlock should be detected promptly, took {:?}", elapsed_b);

    assert!(a.join().unwrap(), "the surviving thread should proceed once its rival backs off");
}
