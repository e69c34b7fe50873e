//! Registry error types.

use thiserror::Error;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("registration rejected: {0}")]
    Registration(String),

    #[error("promotion conflict on {key} after {attempts} attempts")]
    PromotionConflict { key: String, attempts: u32 },

    #[error("external id conflict for job {jid}: already {existing}, requested {requested}")]
    ExternalIdConflict {
        jid: i64,
        existing: String,
        requested: String,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error(transparent)]
    Core(#[from] nocturn_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
