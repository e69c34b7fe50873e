//! Difference-image repository.

use crate::error::RegistryResult;
use crate::models::DiffImageRow;
use async_trait::async_trait;

/// Attributes of a difference image at registration time.
#[derive(Debug, Clone)]
pub struct NewDiffImage {
    pub rid: i64,
    pub rfid: i64,
    pub ppid: i32,
    pub filename: String,
    pub checksum: String,
    pub ra1: f64,
    pub dec1: f64,
    pub ra2: f64,
    pub dec2: f64,
    pub ra3: f64,
    pub dec3: f64,
    pub ra4: f64,
    pub dec4: f64,
}

/// Repository for difference images.
#[async_trait]
pub trait DiffImageRepo: Send + Sync {
    /// Register a new version for (rid, rfid); returns (pid, version).
    async fn register_diff_image(&self, image: &NewDiffImage) -> RegistryResult<(i64, i32)>;

    /// Finalize a provisional row, keyed by (pid, version). Idempotent.
    async fn finalize_diff_image(
        &self,
        pid: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()>;

    /// Atomically make `pid` the single best version of its chain.
    async fn promote_best_diff_image(&self, rid: i64, rfid: i64, pid: i64) -> RegistryResult<()>;

    /// Best visible difference image for (rid, rfid), if any.
    async fn get_best_diff_image(
        &self,
        rid: i64,
        rfid: i64,
    ) -> RegistryResult<Option<DiffImageRow>>;

    /// Get a difference image by id.
    async fn get_diff_image(&self, pid: i64) -> RegistryResult<Option<DiffImageRow>>;
}
