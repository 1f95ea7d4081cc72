//! Crate-wide error taxonomy.
//!
//! Component modules define their own narrow `thiserror` enums (see
//! `findings::FindingsError`, `dispatcher::DispatchError`, `baseline::BaselineError`)
//! and convert into `PatrolError` at the boundary the same way the call site needs it.
//! Nothing in this taxonomy escapes to a panic; `Fatal` is the only variant that
//! terminates the engine's main loop, and only during a cooperative shutdown.

use thiserror::Error;

/// Top-level error taxonomy for the patrol control plane (see SPEC_FULL.md §7).
#[derive(Debug, Error)]
pub enum PatrolError {
    /// Network, timeout, 5xx, or 429 from an upstream capability. Counts toward
    /// the circuit breaker and is retried at the next scheduler tick.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// 401/402/403 from an upstream capability. Does not trip the circuit
    /// breaker; surfaces as a self-resolving finding instead.
    #[error("permanent upstream failure: {0}")]
    PermanentUpstream(String),

    /// A finding proposed by the LLM failed `ThresholdGuard` validation.
    #[error("finding rejected by threshold guard: {0}")]
    ValidationRejected(String),

    /// The run lock was busy when a run was attempted.
    #[error("run dispatch contention: {0}")]
    Contention(String),

    /// A run or investigation exceeded its budget and was force-recovered.
    #[error("stuck state recovered: {0}")]
    Stuck(String),

    /// Persisting findings/run records/suppression rules failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The engine was asked to start without a configured interval.
    #[error("engine not configured: {0}")]
    EngineNotConfigured(String),

    /// Cooperative shutdown is in progress; the caller should stop retrying.
    #[error("fatal: shutting down")]
    Fatal,
}

impl PatrolError {
    /// Whether this error class counts toward circuit-breaker trip accounting.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }
}

pub type PatrolResult<T> = Result<T, PatrolError>;
