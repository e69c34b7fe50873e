//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ObjectMeta, ObjectStore, validate_bucket, validate_key};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::instrument;

fn map_s3_error<E>(err: aws_sdk_s3::error::SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StorageError::S3(Box::new(err))
}

fn is_404<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    if let aws_sdk_s3::error::SdkError::ServiceError(service_err) = err {
        service_err.raw().status().as_u16() == 404
    } else {
        false
    }
}

/// S3-compatible object store. Buckets are real S3 buckets; credentials
/// come from the ambient AWS credential chain.
pub struct S3Backend {
    client: Client,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend").finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend for the given region, optionally against a
    /// custom endpoint (e.g. MinIO).
    pub async fn new(region: &str, endpoint: Option<String>) -> StorageResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()));

        if let Some(endpoint_url) = endpoint {
            // Bare host:port endpoints (e.g. "minio:9000") get a scheme.
            let endpoint_url = if endpoint_url.starts_with("http://")
                || endpoint_url.starts_with("https://")
            {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            };
            loader = loader.endpoint_url(endpoint_url);
        }

        let config = loader.load().await;
        Ok(Self {
            client: Client::new(&config),
        })
    }

    fn not_found(bucket: &str, key: &str) -> StorageError {
        StorageError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_404(&err) => Ok(false),
            Err(err) => Err(map_s3_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let output = match self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_404(&err) => return Err(Self::not_found(bucket, key)),
            Err(err) => return Err(map_s3_error(err)),
        };

        let last_modified = output
            .last_modified()
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0) as u64,
            last_modified,
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let output = match self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) if is_404(&err) => return Err(Self::not_found(bucket, key)),
            Err(err) => return Err(map_s3_error(err)),
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();
        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> StorageResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        // S3 delete_object does not error on missing keys.
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        validate_bucket(bucket)?;
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(map_s3_error)?;

            for obj in output.contents() {
                if let Some(obj_key) = obj.key() {
                    results.push(obj_key.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn copy(
        &self,
        from_bucket: &str,
        from_key: &str,
        to_bucket: &str,
        to_key: &str,
    ) -> StorageResult<()> {
        validate_bucket(from_bucket)?;
        validate_key(from_key)?;
        validate_bucket(to_bucket)?;
        validate_key(to_key)?;

        let copy_source = format!("{from_bucket}/{from_key}");
        self.client
            .copy_object()
            .bucket(to_bucket)
            .key(to_key)
            .copy_source(&copy_source)
            .send()
            .await
            .map_err(map_s3_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
