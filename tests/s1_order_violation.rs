use std::time::{Duration, Instant};

use nodecore_sync::{CoreError, LockManager, LockMode, LockRank};

fn deadline_in(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

#[test]
fn acquiring_a_lower_rank_lock_while_holding_a_higher_one_is_rejected() {
    let mgr = LockManager::new();
    let mempool = mgr.acquire("mempool", LockRank::Mempool.rank(), LockMode::Shared, deadline_in(200)).unwrap();

    let result = mgr.acquire("blockchain", LockRank::Blockchain.rank(), LockMode::Exclusive, deadline_in(200));
    assert!(matches!(result, Err(CoreError::OrderViolation { .. })));

    // The thread's already-held lock is untouched by the rejected attempt.
    drop(mempool);
    let reacquired = mgr.acquire("mempool", LockRank::Mempool.rank(), LockMode::Exclusive, deadline_in(200));
    assert!(reacquired.is_ok());
}
