//! Process-level configuration for the embedding node.
//!
//! Mirrors the original node's CLI-plus-env-override pattern, minus the CLI: this crate has no
//! binary of its own, so `from_env` just performs the env var walk a `clap` front-end would have
//! applied after parsing.

use crate::error::CoreError;

const DEFAULT_SNAPSHOT_CACHE_BOUND: usize = 5;
const DEFAULT_LOCK_DEADLINE_MS: u64 = 5_000;
const DEFAULT_TARGET_BLOCK_TIME_SECS: u64 = 30;
const DEFAULT_MINING_BATCH_SIZE: u64 = 4_096;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory the session journal and its `.lock` sibling live in.
    pub session_dir: String,
    /// Max number of cached UTXO snapshots before LRU-among-zero-refs eviction kicks in.
    pub snapshot_cache_bound: usize,
    /// Default deadline for lock acquisition when a caller does not specify one.
    pub default_lock_deadline_ms: u64,
    /// Target time between blocks; mining lease duration defaults to twice this.
    pub target_block_time_secs: u64,
    /// Explicit mining lease duration override; `None` means `2 * target_block_time_secs`.
    pub mining_lease_secs: Option<u64>,
    /// Nonce batch size workers poll the stop flag between.
    pub mining_batch_size: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            session_dir: "./session".to_string(),
            snapshot_cache_bound: DEFAULT_SNAPSHOT_CACHE_BOUND,
            default_lock_deadline_ms: DEFAULT_LOCK_DEADLINE_MS,
            target_block_time_secs: DEFAULT_TARGET_BLOCK_TIME_SECS,
            mining_lease_secs: None,
            mining_batch_size: DEFAULT_MINING_BATCH_SIZE,
        }
    }
}

impl NodeConfig {
    /// Effective mining lease duration: the explicit override, or `2 * target_block_time_secs`.
    pub fn mining_lease_secs(&self) -> u64 {
        self.mining_lease_secs.unwrap_or(self.target_block_time_secs * 2)
    }

    /// Build from defaults overridden by `NODECORE_*` environment variables, the same override
    /// pattern the original node's `main.rs` applies after CLI parsing.
    pub fn from_env() -> Result<Self, CoreError> {
        let mut cfg = NodeConfig::default();

        if let Ok(v) = std::env::var("NODECORE_SESSION_DIR") {
            cfg.session_dir = v;
        }
        if let Ok(v) = std::env::var("NODECORE_SNAPSHOT_CACHE_BOUND") {
            cfg.snapshot_cache_bound = v
                .parse()
                .map_err(|_| CoreError::InvalidArgument { reason: "NODECORE_SNAPSHOT_CACHE_BOUND must be a positive integer".into() })?;
        }
        if let Ok(v) = std::env::var("NODECORE_LOCK_DEADLINE_MS") {
            cfg.default_lock_deadline_ms = v
                .parse()
                .map_err(|_| CoreError::InvalidArgument { reason: "NODECORE_LOCK_DEADLINE_MS must be an integer".into() })?;
        }
        if let Ok(v) = std::env::var("NODECORE_TARGET_BLOCK_TIME_SECS") {
            cfg.target_block_time_secs = v
                .parse()
                .map_err(|_| CoreError::InvalidArgument { reason: "NODECORE_TARGET_BLOCK_TIME_SECS must be an integer".into() })?;
        }
        if let Ok(v) = std::env::var("NODECORE_MINING_BATCH_SIZE") {
            cfg.mining_batch_size = v
                .parse()
                .map_err(|_| CoreError::InvalidArgument { reason: "NODECORE_MINING_BATCH_SIZE must be an integer".into() })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.snapshot_cache_bound == 0 {
            return Err(CoreError::InvalidArgument { reason: "snapshot_cache_bound must be > 0".into() });
        }
        if self.mining_batch_size == 0 {
            return Err(CoreError::InvalidArgument { reason: "mining_batch_size must be > 0".into() });
        }
        if self.target_block_time_secs == 0 {
            return Err(CoreError::InvalidArgument { reason: "target_block_time_secs must be > 0".into() });
        }
        Ok(())
    }
}
