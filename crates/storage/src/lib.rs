//! Object storage abstraction and backends for Nocturn.
//!
//! This crate provides:
//! - Put/get by bucket+key and list-by-prefix for pixel-data products and
//!   per-job config/log artifacts
//! - Backends: local filesystem, in-memory (tests), and S3-compatible

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use backends::memory::MemoryBackend;
pub use backends::s3::S3Backend;
pub use error::{StorageError, StorageResult};
pub use traits::{ObjectMeta, ObjectStore};

use nocturn_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    match config {
        StorageConfig::Filesystem { root } => {
            let backend = FilesystemBackend::new(root).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        StorageConfig::S3 { region, endpoint } => {
            let backend = S3Backend::new(region, endpoint.clone()).await?;
            Ok(Arc::new(backend))
        }
    }
}
