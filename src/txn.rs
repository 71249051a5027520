//! Two-phase commit combining C1 lock requirements and ordered do/undo operation pairs (C4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::CoreResult;
use crate::locks::{LockManager, LockMode};

type DoFn = Box<dyn FnOnce() -> CoreResult<()>>;
type UndoFn = Box<dyn FnOnce()>;

struct LockRequirement {
    name: String,
    rank: u8,
    mode: LockMode,
}

struct Operation {
    do_fn: DoFn,
    undo_fn: UndoFn,
}

/// Aggregates lock requirements and an ordered list of (do, undo) operation pairs, then commits
/// them as a two-phase transaction: acquire every required lock (rank-ascending, same-lock modes
/// coalesced to exclusive), then apply every `do` in order, unwinding via `undo` on failure.
pub struct TransactionContext {
    lock_manager: Arc<LockManager>,
    requirements: Vec<LockRequirement>,
    operations: Vec<Operation>,
}

impl TransactionContext {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        TransactionContext { lock_manager, requirements: Vec::new(), operations: Vec::new() }
    }

    pub fn require_lock(&mut self, name: &str, rank: u8, mode: LockMode) {
        self.requirements.push(LockRequirement { name: name.to_string(), rank, mode });
    }

    pub fn add_operation<D, U>(&mut self, do_fn: D, undo_fn: U)
    where
        D: FnOnce() -> CoreResult<()> + 'static,
        U: FnOnce() + 'static,
    {
        self.operations.push(Operation { do_fn: Box::new(do_fn), undo_fn: Box::new(undo_fn) });
    }

    /// Runs phase 1 (acquire) then phase 2 (apply), per §4.4. Consumes `self`: a context is
    /// single-use.
    pub fn commit(mut self, deadline: Instant) -> CoreResult<()> {
        let mut coalesced: HashMap<String, (u8, LockMode)> = HashMap::new();
        for req in self.requirements.drain(..) {
            coalesced
                .entry(req.name)
                .and_modify(|(_, mode)| {
                    if *mode != req.mode {
                        *mode = LockMode::Exclusive;
                    }
                })
                .or_insert((req.rank, req.mode));
        }
        let mut sorted: Vec<(String, u8, LockMode)> = coalesced.into_iter().map(|(name, (rank, mode))| (name, rank, mode)).collect();
        sorted.sort_by_key(|(_, rank, _)| *rank);

        let mut guards = Vec::with_capacity(sorted.len());
        for (name, rank, mode) in &sorted {
            match self.lock_manager.acquire(name, *rank, *mode, deadline) {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    while let Some(g) = guards.pop() {
                        drop(g);
                    }
                    return Err(e);
                }
            }
        }

        let mut executed: Vec<UndoFn> = Vec::with_capacity(self.operations.len());
        let mut failure = None;
        for op in self.operations.drain(..) {
            match (op.do_fn)() {
                Ok(()) => executed.push(op.undo_fn),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            log::warn!("transaction failed mid-commit ({}), unwinding {} executed operation(s)", e, executed.len());
            while let Some(undo) = executed.pop() {
                undo();
            }
            while let Some(g) = guards.pop() {
                drop(g);
            }
            return Err(e);
        }

        while let Some(g) = guards.pop() {
            drop(g);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::locks::LockRank;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn successful_commit_applies_all_dos_in_order() {
        let mgr = Arc::new(LockManager::new());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut txn = TransactionContext::new(mgr);
        txn.require_lock("blockchain", LockRank::Blockchain.rank(), LockMode::Exclusive);
        txn.require_lock("utxo", LockRank::Utxo.rank(), LockMode::Exclusive);

        let log1 = log.clone();
        txn.add_operation(move || { log1.lock().push(1); Ok(()) }, || {});
        let log2 = log.clone();
        txn.add_operation(move || { log2.lock().push(2); Ok(()) }, || {});

        txn.commit(deadline_in(200)).unwrap();
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    // Invariant 5 — a failed commit leaves state bit-identical to before, given correct undos.
    #[test]
    fn failed_commit_is_fully_undone() {
        let mgr = Arc::new(LockManager::new());
        let state = Arc::new(AtomicI64::new(0));

        let mut txn = TransactionContext::new(mgr);
        txn.require_lock("blockchain", LockRank::Blockchain.rank(), LockMode::Exclusive);
        txn.require_lock("utxo", LockRank::Utxo.rank(), LockMode::Exclusive);

        let s1 = state.clone();
        let u1 = state.clone();
        txn.add_operation(
            move || { s1.fetch_add(10, Ordering::SeqCst); Ok(()) },
            move || { u1.fetch_sub(10, Ordering::SeqCst); },
        );
        txn.add_operation(
            || Err(CoreError::InvalidArgument { reason: "simulated failure".into() }),
            || {},
        );

        let result = txn.commit(deadline_in(200));
        assert!(result.is_err());
        assert_eq!(state.load(Ordering::SeqCst), 0, "first op's effect must be undone");
    }

    #[test]
    fn same_lock_required_in_both_modes_coalesces_to_exclusive() {
        let mgr = Arc::new(LockManager::new());
        let mut txn = TransactionContext::new(mgr);
        txn.require_lock("mempool", LockRank::Mempool.rank(), LockMode::Shared);
        txn.require_lock("mempool", LockRank::Mempool.rank(), LockMode::Exclusive);
        txn.add_operation(|| Ok(()), || {});
        txn.commit(deadline_in(200)).unwrap();
    }

    #[test]
    fn acquisition_failure_runs_no_operations() {
        let mgr = Arc::new(LockManager::new());
        let _held = mgr.acquire("blockchain", LockRank::Blockchain.rank(), LockMode::Exclusive, deadline_in(500)).unwrap();

        let ran = Arc::new(AtomicI64::new(0));
        let mut txn = TransactionContext::new(mgr);
        txn.require_lock("blockchain", LockRank::Blockchain.rank(), LockMode::Shared);
        let ran1 = ran.clone();
        txn.add_operation(move || { ran1.fetch_add(1, Ordering::SeqCst); Ok(()) }, || {});

        let result = txn.commit(deadline_in(20));
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
