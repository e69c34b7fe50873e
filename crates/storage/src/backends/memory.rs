//! In-memory storage backend, for tests and dry runs.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectMeta, ObjectStore, validate_bucket, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::RwLock;
use time::OffsetDateTime;

struct StoredObject {
    data: Bytes,
    last_modified: OffsetDateTime,
}

/// In-process object store backed by a sorted map.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let objects = self.objects.read().unwrap();
        Ok(objects.contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let objects = self.objects.read().unwrap();
        let obj = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| Self::not_found(bucket, key))?;
        Ok(ObjectMeta {
            size: obj.data.len() as u64,
            last_modified: Some(obj.last_modified),
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let objects = self.objects.read().unwrap();
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
            .ok_or_else(|| Self::not_found(bucket, key))
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let mut objects = self.objects.write().unwrap();
        objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                last_modified: OffsetDateTime::now_utc(),
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let mut objects = self.objects.write().unwrap();
        objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        validate_bucket(bucket)?;
        let objects = self.objects.read().unwrap();
        Ok(objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn copy(
        &self,
        from_bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> StorageResult<()> {
        let data = self.get(from_bucket, from_key).await?;
        self.put(to_bucket, to_key, data).await
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
