//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid coordinate: ra={ra}, dec={dec} (expected ra in [0,360), dec in [-90,90])")]
    InvalidCoordinate { ra: f64, dec: f64 },

    #[error("unknown sky tile: {0}")]
    UnknownTile(i64),

    #[error("invalid tag level: {0} (supported levels are 0..=13)")]
    InvalidTagLevel(u8),

    #[error("tessellation data error: {0}")]
    Tessellation(String),

    #[error("input file does not exist: {0}")]
    MissingInputFile(String),

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error computing checksum for {path}: {source}")]
    ChecksumIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid job status: {0}")]
    InvalidJobStatus(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
