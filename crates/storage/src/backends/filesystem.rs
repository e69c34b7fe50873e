//! Local filesystem storage backend.
//!
//! Buckets are top-level subdirectories of the root; keys are relative
//! paths beneath them. Writes go through a temp file + rename so readers
//! never observe a partial object.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectMeta, ObjectStore, validate_bucket, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let path = self.object_path(bucket, key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(bucket, key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| Self::not_found(bucket, key))?;
        let last_modified = meta
            .modified()
            .ok()
            .map(time::OffsetDateTime::from);
        Ok(ObjectMeta {
            size: meta.len(),
            last_modified,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Self::not_found(bucket, key))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename within the same directory is atomic on POSIX.
        let file_name = path
            .file_name()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?
            .to_string_lossy()
            .into_owned();
        let tmp = path.with_file_name(format!("{file_name}.tmp-write"));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        validate_bucket(bucket)?;
        if !prefix.is_empty() {
            validate_key(prefix)?;
        }

        let bucket_root = self.root.join(bucket);
        if !fs::try_exists(&bucket_root).await? {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut stack = vec![bucket_root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(&bucket_root) {
                    let key = rel.to_string_lossy().replace('\\', "/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
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
        "filesystem"
    }
}
