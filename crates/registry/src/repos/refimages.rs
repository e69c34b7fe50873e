//! Reference-image repository.

use crate::error::RegistryResult;
use crate::models::{RefImageMetaRow, RefImageRow};
use async_trait::async_trait;

/// Attributes of a reference image at registration time. Rows are created
/// provisional (status 0) and finalized once the coadd product lands in
/// object storage.
#[derive(Debug, Clone)]
pub struct NewRefImage {
    pub ppid: i32,
    pub field: i64,
    pub fid: i16,
    pub infobits: i32,
    pub filename: String,
    pub checksum: String,
}

/// Repository for reference images and their quality sidecars.
#[async_trait]
pub trait RefImageRepo: Send + Sync {
    /// Register a new version for (ppid, field, fid); returns
    /// (rfid, version).
    async fn register_ref_image(&self, image: &NewRefImage) -> RegistryResult<(i64, i32)>;

    /// Finalize a provisional row, keyed by (rfid, version). Idempotent.
    async fn finalize_ref_image(
        &self,
        rfid: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()>;

    /// Atomically make `rfid` the single best version of its chain. Two
    /// pipeline instances racing here converge to one winner; the loser
    /// re-reads the winner and proceeds.
    async fn promote_best_ref_image(
        &self,
        ppid: i32,
        field: i64,
        fid: i16,
        rfid: i64,
    ) -> RegistryResult<()>;

    /// Best visible reference image for (ppid, field, fid). None means
    /// "build one", not an error.
    async fn get_best_ref_image(
        &self,
        ppid: i32,
        field: i64,
        fid: i16,
    ) -> RegistryResult<Option<RefImageRow>>;

    /// Get a reference image by id.
    async fn get_ref_image(&self, rfid: i64) -> RegistryResult<Option<RefImageRow>>;

    /// Insert or replace the quality sidecar of a reference image.
    async fn upsert_ref_image_meta(&self, meta: &RefImageMetaRow) -> RegistryResult<()>;

    /// Get the quality sidecar of a reference image.
    async fn get_ref_image_meta(&self, rfid: i64) -> RegistryResult<Option<RefImageMetaRow>>;
}
