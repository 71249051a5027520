//! Aggregates the per-component counters into one JSON document (§6 "Statistics").

use std::collections::HashMap;

use serde::Serialize;

use crate::locks::LockManager;
use crate::mining::WorkCoordinator;
use crate::utxo::UtxoSet;

#[derive(Debug, Clone, Serialize)]
pub struct LockStatsReport {
    pub acquisitions: i64,
    pub contentions: i64,
    pub deadlock_attempts: i64,
    pub max_wait_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadlockStatsReport {
    /// Every detected cycle is rejected before the thread blocks, so this equals `prevented`.
    pub cycles_detected: i64,
    pub prevented: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UtxoStatsReport {
    pub version: u64,
    pub conflicts: i64,
    pub snapshots_cached: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MiningStatsReport {
    pub template_fingerprint: Option<String>,
    pub assignments_live: usize,
    pub ranges_completed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub locks: HashMap<String, LockStatsReport>,
    pub deadlock: DeadlockStatsReport,
    pub utxo: UtxoStatsReport,
    pub mining: MiningStatsReport,
}

impl Statistics {
    pub fn collect(lock_manager: &LockManager, utxo: &UtxoSet, mining: &WorkCoordinator) -> Self {
        let locks = lock_manager
            .lock_names()
            .into_iter()
            .filter_map(|name| {
                lock_manager.lock_stats(&name).map(|s| {
                    (
                        name,
                        LockStatsReport {
                            acquisitions: s.acquisitions,
                            contentions: s.contentions,
                            deadlock_attempts: s.deadlock_attempts,
                            max_wait_seconds: s.max_wait_seconds,
                        },
                    )
                })
            })
            .collect();

        let mining_stats = mining.stats();
        let total_deadlocks = lock_manager.total_deadlocks_detected();

        Statistics {
            locks,
            deadlock: DeadlockStatsReport { cycles_detected: total_deadlocks, prevented: total_deadlocks },
            utxo: UtxoStatsReport { version: utxo.version(), conflicts: utxo.conflicts(), snapshots_cached: utxo.snapshots_cached() },
            mining: MiningStatsReport {
                template_fingerprint: mining_stats.template_fingerprint,
                assignments_live: mining_stats.assignments_live,
                ranges_completed: mining_stats.ranges_completed,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
