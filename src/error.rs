//! Typed error taxonomy surfaced from every public API in this crate.

use thiserror::Error;

/// The seven error kinds a core API can return.
///
/// `LockTimeout`, `WriteConflict`, and `StaleTemplate` are retryable; see
/// [`CoreError::is_retryable`]. `OrderViolation` and `DeadlockDetected` signal a programming or
/// schedule defect and are never retried automatically.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    #[error("timed out waiting for lock \"{lock}\" after {waited_ms}ms")]
    LockTimeout { lock: String, waited_ms: u64 },

    #[error("order violation: attempted to acquire \"{attempted}\" (rank {attempted_rank}) while holding \"{held}\" (rank {held_rank})")]
    OrderViolation {
        attempted: String,
        attempted_rank: u8,
        held: String,
        held_rank: u8,
    },

    #[error("deadlock detected: thread {thread:?} would cycle back to itself waiting for \"{lock}\"")]
    DeadlockDetected { thread: String, lock: String },

    #[error("write conflict on outpoint {outpoint}")]
    WriteConflict { outpoint: String },

    #[error("session file is corrupt: {reason}")]
    CorruptSessionFile { reason: String },

    #[error("stale template: result referenced fingerprint {got}, current is {current:?}")]
    StaleTemplate { got: String, current: Option<String> },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

impl CoreError {
    /// Whether the embedding process should retry this error with backoff-and-jitter, per the
    /// propagation policy: `LockTimeout`, `WriteConflict`, and `StaleTemplate` are retryable;
    /// `OrderViolation` and `DeadlockDetected` are programmer/schedule defects that are logged
    /// and not retried automatically; `CorruptSessionFile` and `InvalidArgument` are terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::LockTimeout { .. } | CoreError::WriteConflict { .. } | CoreError::StaleTemplate { .. }
        )
    }

    /// Whether this error indicates a programmer or schedule defect rather than ordinary
    /// contention. These are logged by the embedding process rather than retried.
    pub fn is_defect(&self) -> bool {
        matches!(self, CoreError::OrderViolation { .. } | CoreError::DeadlockDetected { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Exponential backoff with full jitter for retrying a [`CoreError::is_retryable`] failure:
/// `random(0, min(cap, base * 2^attempt))`.
pub fn backoff_with_jitter(attempt: u32, base: std::time::Duration, cap: std::time::Duration) -> std::time::Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX)).min(cap);
    let jittered_ms = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=exp.as_millis().max(1) as u64);
    std::time::Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::LockTimeout { lock: "x".into(), waited_ms: 5 }.is_retryable());
        assert!(CoreError::WriteConflict { outpoint: "x".into() }.is_retryable());
        assert!(CoreError::StaleTemplate { got: "a".into(), current: None }.is_retryable());
    }

    #[test]
    fn non_retryable_defects() {
        let order = CoreError::OrderViolation {
            attempted: "blockchain".into(),
            attempted_rank: 1,
            held: "mempool".into(),
            held_rank: 3,
        };
        assert!(!order.is_retryable());
        assert!(order.is_defect());

        let deadlock = CoreError::DeadlockDetected { thread: "T1".into(), lock: "L1".into() };
        assert!(!deadlock.is_retryable());
        assert!(deadlock.is_defect());
    }

    #[test]
    fn backoff_grows_with_attempt_and_respects_cap() {
        use std::time::Duration;
        for attempt in 0..10 {
            let d = backoff_with_jitter(attempt, Duration::from_millis(10), Duration::from_secs(1));
            assert!(d <= Duration::from_secs(1));
        }
    }

    #[test]
    fn terminal_kinds_are_neither() {
        let corrupt = CoreError::CorruptSessionFile { reason: "bad json".into() };
        assert!(!corrupt.is_retryable());
        assert!(!corrupt.is_defect());

        let invalid = CoreError::InvalidArgument { reason: "zero capacity".into() };
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_defect());
    }
}
