//! Control-plane error types and exit-code mapping.

use nocturn_core::exitcode;
use thiserror::Error;

/// Control-plane errors.
#[derive(Debug, Error)]
pub enum OpsError {
    #[error(transparent)]
    Registry(#[from] nocturn_registry::RegistryError),

    #[error(transparent)]
    Storage(#[from] nocturn_storage::StorageError),

    #[error(transparent)]
    Batch(#[from] nocturn_batch::BatchError),

    #[error(transparent)]
    Core(#[from] nocturn_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("interrupted by operator")]
    Interrupted,

    #[error("status polling failed after {sweeps} consecutive failed sweeps: {source}")]
    PollingExhausted {
        sweeps: u32,
        #[source]
        source: nocturn_batch::BatchError,
    },
}

impl OpsError {
    /// Map an error to the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Registry(_) => exitcode::REGISTRY_FAILURE,
            Self::Storage(nocturn_storage::StorageError::NotFound { .. }) => {
                exitcode::MISSING_INPUT
            }
            Self::Storage(_) => exitcode::CONFIG_ERROR,
            Self::Batch(_) | Self::PollingExhausted { .. } => exitcode::CONFIG_ERROR,
            Self::Core(err) => exitcode::for_core_error(err),
            Self::Config(_) => exitcode::CONFIG_ERROR,
            Self::Interrupted => exitcode::INTERRUPTED,
        }
    }
}

/// Result type for control-plane operations.
pub type OpsResult<T> = std::result::Result<T, OpsError>;
