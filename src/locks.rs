//! Named, ranked, deadlock-detecting reader-writer locks (C1).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::atomic::AtomicCounter;
use crate::error::CoreError;

/// Canonical ranks for the node's well-known subsystem locks. Callers may also register
/// arbitrary lock names with arbitrary ranks; this enum is a convenience, not a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRank {
    Blockchain = 1,
    Utxo = 2,
    Mempool = 3,
    Peers = 4,
    Session = 5,
    Mining = 6,
    Network = 7,
}

impl LockRank {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct HeldLock {
    name: String,
    rank: u8,
}

thread_local! {
    static HELD_LOCKS: RefCell<Vec<HeldLock>> = RefCell::new(Vec::new());
}

#[derive(Default)]
struct LockStateInner {
    readers: HashSet<ThreadId>,
    writer: Option<ThreadId>,
    pending_writers: Vec<ThreadId>,
}

impl LockStateInner {
    fn can_acquire_shared(&self) -> bool {
        self.writer.is_none() && self.pending_writers.is_empty()
    }

    fn can_acquire_exclusive(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    /// The set of threads this lock is presently blocked behind: the current writer, or the
    /// current readers, or — if no one holds it yet but writer-preference is blocking a new
    /// shared request — the threads already waiting to write.
    fn current_owners(&self) -> Vec<ThreadId> {
        if let Some(w) = self.writer {
            vec![w]
        } else if !self.readers.is_empty() {
            self.readers.iter().copied().collect()
        } else {
            self.pending_writers.clone()
        }
    }
}

#[derive(Default)]
struct LockStats {
    acquisitions: AtomicCounter,
    contentions: AtomicCounter,
    deadlock_rejections: AtomicCounter,
    max_wait_ns: AtomicI64,
}

impl LockStats {
    fn record_wait(&self, waited: Duration) {
        let ns = waited.as_nanos().min(i64::MAX as u128) as i64;
        let mut current = self.max_wait_ns.load(Ordering::SeqCst);
        while ns > current {
            match self.max_wait_ns.compare_exchange(current, ns, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Snapshot of one lock's statistics, exported into the overall `Statistics` JSON (§6).
#[derive(Debug, Clone)]
pub struct LockStatSnapshot {
    pub acquisitions: i64,
    pub contentions: i64,
    pub deadlock_attempts: i64,
    pub max_wait_seconds: f64,
}

struct NamedLock {
    rank: u8,
    state: Mutex<LockStateInner>,
    cond: Condvar,
    stats: LockStats,
}

#[derive(Default)]
struct WaitForGraph {
    edges: HashMap<ThreadId, HashSet<ThreadId>>,
}

impl WaitForGraph {
    fn add_edges(&mut self, from: ThreadId, to: &[ThreadId]) {
        let set = self.edges.entry(from).or_default();
        for &t in to {
            set.insert(t);
        }
    }

    fn remove_edges(&mut self, from: ThreadId, to: &[ThreadId]) {
        if let Some(set) = self.edges.get_mut(&from) {
            for t in to {
                set.remove(t);
            }
            if set.is_empty() {
                self.edges.remove(&from);
            }
        }
    }

    /// DFS from `from`; true if it reaches `to`.
    fn has_path(&self, from: ThreadId, to: ThreadId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = self.edges.get(&node) {
                for &n in next {
                    stack.push(n);
                }
            }
        }
        false
    }
}

/// Global registry of named locks plus the wait-for graph used for deadlock detection.
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<NamedLock>>>,
    wait_for: Mutex<WaitForGraph>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager { locks: Mutex::new(HashMap::new()), wait_for: Mutex::new(WaitForGraph::default()) }
    }

    fn get_or_create(&self, name: &str, rank: u8) -> Arc<NamedLock> {
        let mut locks = self.locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(NamedLock { rank, state: Mutex::new(LockStateInner::default()), cond: Condvar::new(), stats: LockStats::default() }))
            .clone()
    }

    /// Acquire `name` (registering it with `rank` if this is the first acquisition of that
    /// name) in `mode`, blocking until success, `LockTimeout`, `DeadlockDetected`, or
    /// `OrderViolation`.
    pub fn acquire(&self, name: &str, rank: u8, mode: LockMode, deadline: Instant) -> Result<LockGuard<'_>, CoreError> {
        self.check_ordering(name, rank)?;

        let named = self.get_or_create(name, rank);
        let this_thread = std::thread::current().id();
        let start = Instant::now();
        let mut contended = false;
        let mut added_pending_writer = false;
        let mut last_owners: Vec<ThreadId> = Vec::new();

        let result = loop {
            let mut state = named.state.lock();
            let can_go = match mode {
                LockMode::Shared => state.can_acquire_shared(),
                LockMode::Exclusive => state.can_acquire_exclusive(),
            };

            if can_go {
                match mode {
                    LockMode::Shared => {
                        state.readers.insert(this_thread);
                    }
                    LockMode::Exclusive => {
                        state.writer = Some(this_thread);
                    }
                }
                if added_pending_writer {
                    state.pending_writers.retain(|t| *t != this_thread);
                }
                break Ok(());
            }

            contended = true;
            if mode == LockMode::Exclusive && !added_pending_writer {
                state.pending_writers.push(this_thread);
                added_pending_writer = true;
            }
            let owners: Vec<ThreadId> = state.current_owners().into_iter().filter(|t| *t != this_thread).collect();
            drop(state);

            if !owners.is_empty() {
                let mut wfg = self.wait_for.lock();
                wfg.add_edges(this_thread, &owners);
                let cycle = owners.iter().any(|&o| wfg.has_path(o, this_thread));
                if cycle {
                    wfg.remove_edges(this_thread, &owners);
                    drop(wfg);
                    self.cleanup_pending(&named, this_thread, added_pending_writer);
                    named.stats.deadlock_rejections.increment();
                    log::warn!("deadlock detected: thread {:?} would cycle waiting for \"{}\"", this_thread, name);
                    break Err(CoreError::DeadlockDetected { thread: format!("{:?}", this_thread), lock: name.to_string() });
                }
                last_owners = owners;
            }

            let now = Instant::now();
            if now >= deadline {
                self.cleanup_pending(&named, this_thread, added_pending_writer);
                if !last_owners.is_empty() {
                    let mut wfg = self.wait_for.lock();
                    wfg.remove_edges(this_thread, &last_owners);
                }
                let waited_ms = start.elapsed().as_millis() as u64;
                log::debug!("timed out waiting for lock \"{}\" after {}ms", name, waited_ms);
                break Err(CoreError::LockTimeout { lock: name.to_string(), waited_ms });
            }

            let mut state = named.state.lock();
            let _ = named.cond.wait_until(&mut state, deadline);
            drop(state);

            if !last_owners.is_empty() {
                let mut wfg = self.wait_for.lock();
                wfg.remove_edges(this_thread, &last_owners);
            }
        };

        match result {
            Ok(()) => {
                named.stats.acquisitions.increment();
                if contended {
                    named.stats.contentions.increment();
                }
                named.stats.record_wait(start.elapsed());
                HELD_LOCKS.with(|h| h.borrow_mut().push(HeldLock { name: name.to_string(), rank }));
                Ok(LockGuard { manager: self, name: name.to_string(), mode, named })
            }
            Err(e) => Err(e),
        }
    }

    fn cleanup_pending(&self, named: &NamedLock, thread: ThreadId, added_pending_writer: bool) {
        if added_pending_writer {
            let mut state = named.state.lock();
            state.pending_writers.retain(|t| *t != thread);
        }
    }

    fn check_ordering(&self, name: &str, rank: u8) -> Result<(), CoreError> {
        HELD_LOCKS.with(|h| {
            for held in h.borrow().iter() {
                if held.name == name || rank < held.rank {
                    log::warn!("order violation: attempted \"{}\" (rank {}) while holding \"{}\" (rank {})", name, rank, held.name, held.rank);
                    return Err(CoreError::OrderViolation { attempted: name.to_string(), attempted_rank: rank, held: held.name.clone(), held_rank: held.rank });
                }
            }
            Ok(())
        })
    }

    fn release(&self, name: &str, mode: LockMode, named: &NamedLock) {
        let this_thread = std::thread::current().id();
        {
            let mut state = named.state.lock();
            match mode {
                LockMode::Shared => {
                    state.readers.remove(&this_thread);
                }
                LockMode::Exclusive => {
                    if state.writer == Some(this_thread) {
                        state.writer = None;
                    }
                }
            }
        }
        named.cond.notify_all();
        HELD_LOCKS.with(|h| {
            let mut held = h.borrow_mut();
            if let Some(pos) = held.iter().rposition(|hl| hl.name == name) {
                held.remove(pos);
            }
        });
    }

    /// Statistics for one named lock, or `None` if it has never been acquired.
    pub fn lock_stats(&self, name: &str) -> Option<LockStatSnapshot> {
        let locks = self.locks.lock();
        locks.get(name).map(|named| LockStatSnapshot {
            acquisitions: named.stats.acquisitions.get(),
            contentions: named.stats.contentions.get(),
            deadlock_attempts: named.stats.deadlock_rejections.get(),
            max_wait_seconds: named.stats.max_wait_ns.load(Ordering::SeqCst) as f64 / 1e9,
        })
    }

    /// All lock names currently registered, for statistics export.
    pub fn lock_names(&self) -> Vec<String> {
        self.locks.lock().keys().cloned().collect()
    }

    pub fn total_deadlocks_detected(&self) -> i64 {
        self.locks.lock().values().map(|n| n.stats.deadlock_rejections.get()).sum()
    }
}

/// RAII guard releasing its lock on every exit path, including stack unwinding.
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    name: String,
    mode: LockMode,
    named: Arc<NamedLock>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.name, self.mode, &self.named);
    }
}
