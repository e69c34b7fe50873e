//! Batch client error types.

use thiserror::Error;

/// Batch-compute client errors.
///
/// `Transient` failures are retried by the enclosing poll loop; everything
/// else is surfaced to the caller.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("job submission failed: {0}")]
    Submit(String),

    #[error("status query failed (transient): {0}")]
    Transient(String),

    #[error("unknown external job id: {0}")]
    UnknownJob(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BatchError {
    /// Whether the enclosing poll loop should retry at its next sweep.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for batch operations.
pub type BatchResult<T> = std::result::Result<T, BatchError>;
