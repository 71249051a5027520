//! Disjoint nonce-range work coordination, result arbitration, and worker-pool supervision (C5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::error::{CoreError, CoreResult};

/// An opaque block template: the wire format is a non-goal (§1), so callers supply their own
/// fingerprint (a digest of the template's contents) and the target the winning hash must meet.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub fingerprint: String,
    pub difficulty: u64,
    pub target: [u8; 32],
}

pub fn fingerprint_of(template_bytes: &[u8]) -> String {
    blake3::hash(template_bytes).to_hex().to_string()
}

#[derive(Debug, Clone)]
pub struct MiningWork {
    pub template_fingerprint: String,
    pub target_difficulty: u64,
    pub nonce_start: u64,
    pub nonce_end: u64,
    pub assignee_id: String,
    pub issued_at: Instant,
}

impl MiningWork {
    pub fn contains(&self, nonce: u64) -> bool {
        nonce >= self.nonce_start && nonce < self.nonce_end
    }
}

#[derive(Debug, Clone)]
pub enum ReportOutcome {
    Found { nonce: u64, hash: [u8; 32] },
    Exhausted,
    Abandoned,
}

#[derive(Debug, Clone, Default)]
pub struct MiningStats {
    pub template_fingerprint: Option<String>,
    pub assignments_live: usize,
    pub ranges_completed: usize,
}

fn hash_meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    hash <= target
}

struct TemplateState {
    template: Option<BlockTemplate>,
    cursor: AtomicU64,
    completed: Vec<(u64, u64)>,
    solved: bool,
}

impl Default for TemplateState {
    fn default() -> Self {
        TemplateState { template: None, cursor: AtomicU64::new(0), completed: Vec::new(), solved: false }
    }
}

/// Owns the current block template and partitions its nonce space across workers without
/// duplication, independent of any particular hashing algorithm.
pub struct WorkCoordinator {
    state: RwLock<TemplateState>,
    assignments: Mutex<HashMap<String, MiningWork>>,
    lease_duration: Duration,
}

impl WorkCoordinator {
    pub fn new(lease_duration: Duration) -> Self {
        WorkCoordinator { state: RwLock::new(TemplateState::default()), assignments: Mutex::new(HashMap::new()), lease_duration }
    }

    /// Replaces the current template: clears the Completed Range Set, resets the cursor, and
    /// invalidates all outstanding assignments.
    pub fn set_template(&self, template: BlockTemplate) {
        log::info!("rotating mining template to fingerprint {}", template.fingerprint);
        let mut state = self.state.write();
        state.template = Some(template);
        state.cursor.store(0, Ordering::SeqCst);
        state.completed.clear();
        state.solved = false;
        drop(state);
        self.assignments.lock().clear();
    }

    pub fn is_solved(&self) -> bool {
        self.state.read().solved
    }

    fn expire_stale_leases(&self) {
        let now = Instant::now();
        let mut assignments = self.assignments.lock();
        assignments.retain(|worker_id, work| {
            let alive = now.duration_since(work.issued_at) < self.lease_duration;
            if !alive {
                log::debug!("lease expired for worker {} on range [{}, {})", worker_id, work.nonce_start, work.nonce_end);
            }
            alive
        });
    }

    /// Returns a disjoint-from-every-other-live-assignment nonce range under the current
    /// template, or `None` if no template is set.
    pub fn assign_work(&self, worker_id: &str, range_size: u64) -> CoreResult<Option<MiningWork>> {
        if range_size == 0 {
            return Err(CoreError::InvalidArgument { reason: "range_size must be > 0".into() });
        }

        self.expire_stale_leases();

        let (fingerprint, difficulty) = {
            let state = self.state.read();
            match &state.template {
                Some(t) => (t.fingerprint.clone(), t.difficulty),
                None => return Ok(None),
            }
        };
        if self.is_solved() {
            return Ok(None);
        }

        loop {
            let state = self.state.read();
            let cursor = state.cursor.load(Ordering::SeqCst);
            let mut start = cursor;
            loop {
                let end = start + range_size;
                let overlap_end = state.completed.iter().filter(|(s, e)| *s < end && *e > start).map(|(_, e)| *e).max();
                match overlap_end {
                    Some(e) if e > start => start = e,
                    _ => break,
                }
            }
            let end = start + range_size;
            let cas_ok = state.cursor.compare_exchange(cursor, end, Ordering::SeqCst, Ordering::SeqCst).is_ok();
            drop(state);

            if cas_ok {
                let work = MiningWork {
                    template_fingerprint: fingerprint.clone(),
                    target_difficulty: difficulty,
                    nonce_start: start,
                    nonce_end: end,
                    assignee_id: worker_id.to_string(),
                    issued_at: Instant::now(),
                };
                self.assignments.lock().insert(worker_id.to_string(), work.clone());
                return Ok(Some(work));
            }
        }
    }

    pub fn report_result(&self, worker_id: &str, outcome: ReportOutcome) -> CoreResult<()> {
        let work = {
            let mut assignments = self.assignments.lock();
            match assignments.remove(worker_id) {
                Some(w) => w,
                None => return Ok(()),
            }
        };

        let current_fingerprint = self.state.read().template.as_ref().map(|t| t.fingerprint.clone());
        if current_fingerprint.as_deref() != Some(work.template_fingerprint.as_str()) {
            return Err(CoreError::StaleTemplate { got: work.template_fingerprint, current: current_fingerprint });
        }

        match outcome {
            ReportOutcome::Found { nonce, hash } => {
                if !work.contains(nonce) {
                    return Err(CoreError::InvalidArgument { reason: format!("nonce {} outside assigned range", nonce) });
                }
                let mut state = self.state.write();
                let target = state.template.as_ref().map(|t| t.target);
                let meets = target.map(|t| hash_meets_target(&hash, &t)).unwrap_or(false);
                if !meets {
                    return Err(CoreError::InvalidArgument { reason: "reported hash does not meet target".into() });
                }
                state.completed.push((work.nonce_start, work.nonce_end));
                state.solved = true;
                log::info!("worker {} found nonce {} for template {}", worker_id, nonce, work.template_fingerprint);
                Ok(())
            }
            ReportOutcome::Exhausted => {
                self.state.write().completed.push((work.nonce_start, work.nonce_end));
                Ok(())
            }
            ReportOutcome::Abandoned => Ok(()),
        }
    }

    pub fn stats(&self) -> MiningStats {
        let state = self.state.read();
        MiningStats {
            template_fingerprint: state.template.as_ref().map(|t| t.fingerprint.clone()),
            assignments_live: self.assignments.lock().len(),
            ranges_completed: state.completed.len(),
        }
    }
}

/// A pluggable hash-vs-target predicate; the actual hashing algorithm is an external
/// collaborator (§1) — this is the "template validator" closure of §9, expressed as a trait
/// object rather than a free function so it can carry algorithm-specific state.
pub trait NonceValidator: Send + Sync {
    fn try_nonce(&self, work: &MiningWork, nonce: u64) -> Option<[u8; 32]>;
}

/// Owns `threads` worker OS threads pulling work from a `WorkCoordinator`. Start/stop are
/// idempotent; stopping waits for every worker to notice the cooperative stop flag.
pub struct Miner {
    id: String,
    control: Mutex<MinerControl>,
    running: AtomicBool,
    stop_flag: Arc<AtomicBool>,
}

struct MinerControl {
    handles: Vec<JoinHandle<()>>,
}

impl Miner {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Miner { id: id.into(), control: Mutex::new(MinerControl { handles: Vec::new() }), running: AtomicBool::new(false), stop_flag: Arc::new(AtomicBool::new(false)) })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>, threads: usize, coordinator: Arc<WorkCoordinator>, validator: Arc<dyn NonceValidator>, batch_size: u64) {
        let mut control = self.control.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        for t in 0..threads {
            let coordinator = coordinator.clone();
            let validator = validator.clone();
            let stop_flag = self.stop_flag.clone();
            let worker_id = format!("{}-{}", self.id, t);
            control.handles.push(std::thread::spawn(move || mining_loop(worker_id, coordinator, validator, stop_flag, batch_size)));
        }
    }

    pub fn stop(&self) {
        let mut control = self.control.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        for handle in control.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn mining_loop(worker_id: String, coordinator: Arc<WorkCoordinator>, validator: Arc<dyn NonceValidator>, stop_flag: Arc<AtomicBool>, batch_size: u64) {
    while !stop_flag.load(Ordering::SeqCst) {
        if coordinator.is_solved() {
            return;
        }
        let work = match coordinator.assign_work(&worker_id, batch_size) {
            Ok(Some(w)) => w,
            Ok(None) => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };

        let mut found = None;
        let mut nonce = work.nonce_start;
        while nonce < work.nonce_end {
            if stop_flag.load(Ordering::SeqCst) {
                let _ = coordinator.report_result(&worker_id, ReportOutcome::Abandoned);
                return;
            }
            if let Some(hash) = validator.try_nonce(&work, nonce) {
                found = Some((nonce, hash));
                break;
            }
            nonce += 1;
        }

        let outcome = match found {
            Some((nonce, hash)) => ReportOutcome::Found { nonce, hash },
            None => ReportOutcome::Exhausted,
        };
        let _ = coordinator.report_result(&worker_id, outcome);
    }
}

/// Owns a set of miners keyed by id. Broadcasts iterate under a shared pool lock; per-miner
/// state changes occur under each `Miner`'s own lock.
pub struct MiningPool {
    miners: RwLock<HashMap<String, Arc<Miner>>>,
}

impl Default for MiningPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MiningPool {
    pub fn new() -> Self {
        MiningPool { miners: RwLock::new(HashMap::new()) }
    }

    pub fn add_miner(&self, miner: Arc<Miner>) {
        self.miners.write().insert(miner.id().to_string(), miner);
    }

    pub fn miner(&self, id: &str) -> Option<Arc<Miner>> {
        self.miners.read().get(id).cloned()
    }

    pub fn start_pool_mining(&self, threads_per_miner: usize, coordinator: Arc<WorkCoordinator>, validator: Arc<dyn NonceValidator>, batch_size: u64) {
        let miners = self.miners.read();
        for miner in miners.values() {
            miner.start(threads_per_miner, coordinator.clone(), validator.clone(), batch_size);
        }
    }

    pub fn stop_all(&self) {
        let miners = self.miners.read();
        for miner in miners.values() {
            miner.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn template(fp: &str) -> BlockTemplate {
        BlockTemplate { fingerprint: fp.to_string(), difficulty: 1, target: [0xff; 32] }
    }

    #[test]
    fn no_template_returns_none() {
        let coordinator = WorkCoordinator::new(Duration::from_secs(30));
        assert!(coordinator.assign_work("w1", 100).unwrap().is_none());
    }

    #[test]
    fn zero_range_size_rejected() {
        let coordinator = WorkCoordinator::new(Duration::from_secs(30));
        coordinator.set_template(template("T1"));
        assert!(matches!(coordinator.assign_work("w1", 0), Err(CoreError::InvalidArgument { .. })));
    }

    // S4 — disjoint mining assignment across three concurrent workers.
    #[test]
    fn s4_disjoint_assignment_across_workers() {
        let coordinator = Arc::new(WorkCoordinator::new(Duration::from_secs(30)));
        coordinator.set_template(template("T1"));

        let barrier = Arc::new(Barrier::new(3));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    coordinator.assign_work(&format!("w{}", i), 100).unwrap().unwrap()
                })
            })
            .collect();

        let mut ranges: Vec<(u64, u64)> = handles.into_iter().map(|h| h.join().unwrap()).map(|w| (w.nonce_start, w.nonce_end)).collect();
        ranges.sort();
        assert_eq!(ranges, vec![(0, 100), (100, 200), (200, 300)]);
    }

    // S5 — template rotation clears the completed set.
    #[test]
    fn s5_template_rotation_clears_completed_set() {
        let coordinator = WorkCoordinator::new(Duration::from_secs(30));
        coordinator.set_template(template("T1"));

        let w1 = coordinator.assign_work("w1", 100).unwrap().unwrap();
        assert_eq!((w1.nonce_start, w1.nonce_end), (0, 100));
        coordinator.report_result("w1", ReportOutcome::Exhausted).unwrap();

        coordinator.set_template(template("T2"));
        let w2 = coordinator.assign_work("w1", 100).unwrap().unwrap();
        assert_eq!((w2.nonce_start, w2.nonce_end), (0, 100), "T2 should reissue [0,100) rather than continue from [100,200)");
    }

    #[test]
    fn found_outside_range_is_rejected() {
        let coordinator = WorkCoordinator::new(Duration::from_secs(30));
        coordinator.set_template(template("T1"));
        coordinator.assign_work("w1", 100).unwrap();
        let result = coordinator.report_result("w1", ReportOutcome::Found { nonce: 9999, hash: [0; 32] });
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }

    #[test]
    fn report_after_template_rotation_is_a_no_op() {
        let coordinator = WorkCoordinator::new(Duration::from_secs(30));
        coordinator.set_template(template("T1"));
        coordinator.assign_work("w1", 100).unwrap();
        coordinator.set_template(template("T2"));
        // w1's assignment was invalidated by set_template, so there is nothing to report against.
        let result = coordinator.report_result("w1", ReportOutcome::Exhausted);
        assert!(result.is_ok());
    }

    #[test]
    fn lease_expiry_treats_assignment_as_abandoned() {
        let coordinator = WorkCoordinator::new(Duration::from_millis(10));
        coordinator.set_template(template("T1"));
        coordinator.assign_work("w1", 100).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(coordinator.stats().assignments_live, 0);
    }

    struct AlwaysFindAt(u64);
    impl NonceValidator for AlwaysFindAt {
        fn try_nonce(&self, work: &MiningWork, nonce: u64) -> Option<[u8; 32]> {
            if nonce == self.0 && work.contains(nonce) {
                Some([0u8; 32])
            } else {
                None
            }
        }
    }

    #[test]
    fn miner_start_stop_is_idempotent_and_finds_target_nonce() {
        let coordinator = Arc::new(WorkCoordinator::new(Duration::from_secs(30)));
        coordinator.set_template(BlockTemplate { fingerprint: "T1".into(), difficulty: 1, target: [0xff; 32] });

        let miner = Miner::new("m1");
        let validator: Arc<dyn NonceValidator> = Arc::new(AlwaysFindAt(42));
        miner.start(2, coordinator.clone(), validator.clone(), 100);
        miner.start(2, coordinator.clone(), validator, 100); // second start is a no-op

        let deadline = Instant::now() + Duration::from_secs(2);
        while !coordinator.is_solved() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(coordinator.is_solved());

        miner.stop();
        miner.stop(); // second stop is a no-op
        assert!(!miner.is_running());
    }
}
