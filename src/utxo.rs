//! Snapshot-isolated, versioned UTXO map with atomic multi-key updates (C3).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::atomic::AtomicCounter;
use crate::error::{CoreError, CoreResult};
use crate::locks::{LockManager, LockMode, LockRank};

pub const UTXO_LOCK_NAME: &str = "utxo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub tx_id: [u8; 32],
    pub output_index: u32,
}

impl Outpoint {
    pub fn new(tx_id: [u8; 32], output_index: u32) -> Self {
        Outpoint { tx_id, output_index }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub amount: u64,
    pub owner: Vec<u8>,
    pub tx_id: [u8; 32],
    pub output_index: u32,
}

/// An immutable view of the UTXO map tagged with the version it was taken at.
pub struct Snapshot {
    version: u64,
    map: HashMap<Outpoint, Output>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, outpoint: &Outpoint) -> Option<&Output> {
        self.map.get(outpoint)
    }

    pub fn iter_by_owner<'a>(&'a self, owner: &'a [u8]) -> impl Iterator<Item = &'a Output> + 'a {
        self.map.values().filter(move |o| o.owner == owner)
    }

    pub fn balance(&self, owner: &[u8]) -> u64 {
        self.iter_by_owner(owner).map(|o| o.amount).sum()
    }
}

struct CachedSnapshot {
    snapshot: Arc<Snapshot>,
    last_accessed: Instant,
}

struct SnapshotCache {
    bound: usize,
    entries: HashMap<u64, CachedSnapshot>,
}

impl SnapshotCache {
    fn new(bound: usize) -> Self {
        SnapshotCache { bound, entries: HashMap::new() }
    }

    fn get(&mut self, version: u64) -> Option<Arc<Snapshot>> {
        let entry = self.entries.get_mut(&version)?;
        entry.last_accessed = Instant::now();
        Some(entry.snapshot.clone())
    }

    fn insert(&mut self, version: u64, snapshot: Arc<Snapshot>) {
        if self.entries.len() >= self.bound && !self.entries.contains_key(&version) {
            self.evict_one();
        }
        self.entries.insert(version, CachedSnapshot { snapshot, last_accessed: Instant::now() });
    }

    /// Evicts the least-recently-accessed entry with no external references, if any exists.
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .filter(|(_, c)| Arc::strong_count(&c.snapshot) == 1)
            .min_by_key(|(_, c)| c.last_accessed)
            .map(|(v, _)| *v);
        if let Some(v) = victim {
            self.entries.remove(&v);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A mapping `outpoint -> Some(output) | None` to apply atomically: `Some` inserts-or-replaces,
/// `None` deletes.
pub type UtxoUpdates = HashMap<Outpoint, Option<Output>>;

pub struct UtxoSet {
    lock_manager: Arc<LockManager>,
    data: RwLock<HashMap<Outpoint, Output>>,
    dirty: parking_lot::Mutex<HashSet<Outpoint>>,
    version: AtomicCounter,
    snapshot_cache: parking_lot::Mutex<SnapshotCache>,
    conflicts: AtomicCounter,
}

impl UtxoSet {
    pub fn new(lock_manager: Arc<LockManager>, snapshot_cache_bound: usize) -> Self {
        UtxoSet {
            lock_manager,
            data: RwLock::new(HashMap::new()),
            dirty: parking_lot::Mutex::new(HashSet::new()),
            version: AtomicCounter::new(0),
            snapshot_cache: parking_lot::Mutex::new(SnapshotCache::new(snapshot_cache_bound)),
            conflicts: AtomicCounter::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.get() as u64
    }

    pub fn snapshots_cached(&self) -> usize {
        self.snapshot_cache.lock().len()
    }

    pub fn conflicts(&self) -> i64 {
        self.conflicts.get()
    }

    /// Returns the current version and a snapshot handle. Lazily builds and caches a new
    /// snapshot only if one for the current version is not already cached.
    pub fn snapshot(&self, deadline: Instant) -> CoreResult<(u64, Arc<Snapshot>)> {
        let _guard = self.lock_manager.acquire(UTXO_LOCK_NAME, LockRank::Utxo.rank(), LockMode::Shared, deadline)?;
        let version = self.version();

        let mut cache = self.snapshot_cache.lock();
        if let Some(existing) = cache.get(version) {
            return Ok((version, existing));
        }
        let map = self.data.read().clone();
        let snapshot = Arc::new(Snapshot { version, map });
        cache.insert(version, snapshot.clone());
        Ok((version, snapshot))
    }

    /// Applies `updates` as a single atomic step, per §4.3. Returns the new version.
    ///
    /// Conflict detection must be race-visible to concurrent callers, so outpoints are reserved
    /// in the Dirty Set under a lock independent of (and held far more briefly than) the coarse
    /// UTXO lock, which is acquired only around the mutation itself in [`Self::apply_locked`].
    /// Holding the coarse lock across the dirty-set check too would serialize every call and
    /// make two callers racing on the same outpoint structurally impossible.
    pub fn atomic_update(&self, updates: UtxoUpdates, deadline: Instant) -> CoreResult<u64> {
        if updates.is_empty() {
            return Ok(self.version());
        }

        {
            let mut dirty = self.dirty.lock();
            for outpoint in updates.keys() {
                if dirty.contains(outpoint) {
                    self.conflicts.increment();
                    let outpoint_str = format!("{}:{}", hex::encode(outpoint.tx_id), outpoint.output_index);
                    log::debug!("write conflict on outpoint {}", outpoint_str);
                    return Err(CoreError::WriteConflict { outpoint: outpoint_str });
                }
            }
            for outpoint in updates.keys() {
                dirty.insert(*outpoint);
            }
        }

        let result = self.apply_locked(&updates, deadline);

        let mut dirty = self.dirty.lock();
        for outpoint in updates.keys() {
            dirty.remove(outpoint);
        }
        drop(dirty);

        result
    }

    /// Mutates the map under the exclusive UTXO lock, held only for this step. Capture a
    /// pre-image so a mid-apply failure (there is none today, but the hook exists per spec
    /// step 7) can be reverted without re-acquiring the lock.
    fn apply_locked(&self, updates: &UtxoUpdates, deadline: Instant) -> CoreResult<u64> {
        let _guard = self.lock_manager.acquire(UTXO_LOCK_NAME, LockRank::Utxo.rank(), LockMode::Exclusive, deadline)?;

        let pre_image: Vec<(Outpoint, Option<Output>)> = {
            let data = self.data.read();
            updates.keys().map(|k| (*k, data.get(k).cloned())).collect()
        };
        let apply_result: Result<(), CoreError> = (|| {
            let mut data = self.data.write();
            for (outpoint, update) in updates {
                match update {
                    Some(output) => {
                        data.insert(*outpoint, output.clone());
                    }
                    None => {
                        data.remove(outpoint);
                    }
                }
            }
            Ok(())
        })();

        match apply_result {
            Ok(()) => {
                self.version.increment();
                Ok(self.version())
            }
            Err(e) => {
                let mut data = self.data.write();
                for (outpoint, prev) in pre_image {
                    match prev {
                        Some(output) => {
                            data.insert(outpoint, output);
                        }
                        None => {
                            data.remove(&outpoint);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Balance against the latest state, briefly taking the shared UTXO lock.
    pub fn balance(&self, owner: &[u8], deadline: Instant) -> CoreResult<u64> {
        let _guard = self.lock_manager.acquire(UTXO_LOCK_NAME, LockRank::Utxo.rank(), LockMode::Shared, deadline)?;
        Ok(self.data.read().values().filter(|o| o.owner == owner).map(|o| o.amount).sum())
    }

    pub fn utxos_for(&self, owner: &[u8], deadline: Instant) -> CoreResult<Vec<Output>> {
        let _guard = self.lock_manager.acquire(UTXO_LOCK_NAME, LockRank::Utxo.rank(), LockMode::Shared, deadline)?;
        Ok(self.data.read().values().filter(|o| o.owner == owner).cloned().collect())
    }
}
