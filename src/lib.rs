//! Concurrency substrate for a multi-threaded blockchain node: a ranked lock manager with
//! deadlock detection, atomic primitives, an MVCC UTXO set, two-phase transaction commit, mining
//! work coordination, and a crash-safe cross-process session store.
//!
//! The consuming node — RPC, P2P, wallet, storage — is an external collaborator; this crate only
//! provides the primitives those subsystems coordinate through.

pub mod atomic;
pub mod config;
pub mod error;
pub mod locks;
pub mod mining;
pub mod session;
pub mod stats;
pub mod txn;
pub mod utxo;

pub use atomic::{AtomicCounter, BoundedQueue};
pub use config::NodeConfig;
pub use error::{backoff_with_jitter, CoreError, CoreResult};
pub use locks::{LockGuard, LockManager, LockMode, LockRank, LockStatSnapshot};
pub use mining::{BlockTemplate, Miner, MiningPool, MiningStats, MiningWork, NonceValidator, ReportOutcome, WorkCoordinator, fingerprint_of};
pub use session::{NodeRecord, SessionStore};
pub use stats::Statistics;
pub use txn::TransactionContext;
pub use utxo::{Outpoint, Output, Snapshot, UtxoSet, UtxoUpdates};
