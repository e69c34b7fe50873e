//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Object store abstraction for pipeline products and per-job artifacts.
///
/// Objects are addressed by (bucket, key). The control plane records
/// product locations in the registry as bucket+key references; the actual
/// pixel-data transfer happens inside the batch jobs, so the operations
/// here are the small control-plane ones: config artifacts, log artifacts,
/// done-markers, and existence checks.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes>;

    /// Put an object, replacing any existing content atomically.
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// List object keys under a prefix, in ascending key order.
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// Copy an object within the store.
    async fn copy(
        &self,
        from_bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> StorageResult<()>;

    /// Static identifier for the backend type, for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify backend connectivity; called once at startup.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Reject keys that could escape a bucket root or confuse listings.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(crate::error::StorageError::InvalidKey("empty key".into()));
    }
    if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
        return Err(crate::error::StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    for component in std::path::Path::new(key).components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => {
                return Err(crate::error::StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }
    }
    Ok(())
}

/// Buckets are single flat names, never paths.
pub(crate) fn validate_bucket(bucket: &str) -> StorageResult<()> {
    if bucket.is_empty()
        || bucket.contains('/')
        || bucket.contains('\\')
        || bucket.contains("..")
    {
        return Err(crate::error::StorageError::InvalidBucket(bucket.to_string()));
    }
    Ok(())
}
