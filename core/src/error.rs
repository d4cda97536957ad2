//! Error kinds for the control plane.
//!
//! Per-record problems (malformed predicates, out-of-order timepoints) are
//! *not* errors: they mark individual timepoints as skipped and never abort
//! a batch. Everything that aborts an operation is a [`MonitorError`].

use monitord_protocol::SignatureParseError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    /// Signature or policy missing; nothing to launch.
    #[error("monitor is not configured: no {missing} set")]
    NotConfigured { missing: &'static str },

    /// The engine's check mode rejected the formula. Recoverable; the
    /// diagnostic is reported to the caller verbatim.
    #[error("policy rejected by the engine: {diagnostic}")]
    NotMonitorable { diagnostic: String },

    /// No live engine handle (never launched, stopped, or child died).
    /// Recoverable by relaunch.
    #[error("engine is not running")]
    EngineNotRunning,

    /// The handle exists but its pipes are unusable.
    #[error("engine pipe is broken: {0}")]
    BrokenPipe(String),

    /// The store has not caught up to the in-memory watermark. The caller
    /// retries; the barrier never blocks indefinitely.
    #[error("store observed index {observed} but watermark is {expected}; retry later")]
    RetryLater { observed: u64, expected: u64 },

    /// Store connection or query failure. Surfaced with diagnostic text,
    /// not retried automatically.
    #[error("store error: {0}")]
    Store(String),

    /// The replacement engine failed to come up during a policy change.
    /// Monitoring is down; operator intervention required.
    #[error("cutover failed, monitoring is down: {0}")]
    CutoverFailed(String),

    /// The signature is immutable once the store schema exists; replacing
    /// it requires resetting the whole instance.
    #[error("signature is already bound; reset the instance to replace it")]
    SignatureBound,

    /// Direct policy set is only allowed before first launch.
    #[error("policy is already active; use change-policy while the engine runs")]
    PolicyBound,

    /// The engine produced output this control plane cannot interpret.
    #[error("unparseable engine output: {0}")]
    EngineOutput(String),

    #[error("invalid events payload: {0}")]
    InvalidEvents(String),

    #[error(transparent)]
    Signature(#[from] SignatureParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl MonitorError {
    /// True for failures the caller can recover from by retrying or by
    /// adjusting the request; false for faults needing an operator.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MonitorError::CutoverFailed(_))
    }
}
