//! Error taxonomy for the relay core.

/// Outcome of a single brokered call that did not produce a result.
///
/// Every variant is non-fatal to a multi-target run: the aggregation engine
/// stops paginating the affected target and keeps what it already has.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Worker not connected: {0}")]
    WorkerUnavailable(String),

    #[error("Worker reported error: {0}")]
    WorkerReportedError(String),

    #[error("Timeout waiting for response after {0} ms")]
    Timeout(u64),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
}

impl CallError {
    /// Short machine-readable kind, used in report rows and events.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::WorkerUnavailable(_) => "worker_unavailable",
            CallError::WorkerReportedError(_) => "worker_error",
            CallError::Timeout(_) => "timeout",
            CallError::ProtocolViolation(_) => "protocol_violation",
        }
    }
}

/// All errors that can occur in the relay core.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("No target URLs supplied")]
    NoTargets,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Materialization error: {0}")]
    Materialization(String),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type RelayResult<T> = Result<T, RelayError>;
