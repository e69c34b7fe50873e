//! Calibrated-image repository.

use crate::error::RegistryResult;
use crate::models::{CalImageMetaRow, CalImageRow, OverlapCandidateRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Attributes of a calibrated image at registration time. The version is
/// assigned by the store; the row starts provisional unless the declared
/// status says otherwise.
#[derive(Debug, Clone)]
pub struct NewCalImage {
    pub expid: i64,
    pub chipid: i16,
    pub field: i64,
    pub fid: i16,
    pub dateobs: OffsetDateTime,
    pub mjdobs: f64,
    pub exptime: f64,
    pub infobits: i32,
    pub filename: String,
    pub checksum: String,
    pub status: i16,
    pub crval1: f64,
    pub crval2: f64,
    pub crpix1: f64,
    pub crpix2: f64,
    pub cd11: f64,
    pub cd12: f64,
    pub cd21: f64,
    pub cd22: f64,
    pub ctype1: String,
    pub ctype2: String,
    pub ra: f64,
    pub dec: f64,
    pub equinox: f64,
    pub zptmag: f64,
    pub skymean: f64,
}

/// Repository for calibrated images and their spatial sidecars.
#[async_trait]
pub trait CalImageRepo: Send + Sync {
    /// Register a new version for (expid, chipid); returns (rid, version).
    async fn register_cal_image(&self, image: &NewCalImage) -> RegistryResult<(i64, i32)>;

    /// Finalize a provisional row, keyed by (rid, version). Idempotent.
    async fn finalize_cal_image(
        &self,
        rid: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()>;

    /// Atomically make `rid` the single best version of its chain.
    async fn promote_best_cal_image(&self, expid: i64, chipid: i16, rid: i64)
    -> RegistryResult<()>;

    /// Best visible calibrated image for (expid, chipid), if any.
    async fn get_best_cal_image(
        &self,
        expid: i64,
        chipid: i16,
    ) -> RegistryResult<Option<CalImageRow>>;

    /// Get a calibrated image by id.
    async fn get_cal_image(&self, rid: i64) -> RegistryResult<Option<CalImageRow>>;

    /// Insert or replace the spatial sidecar of a calibrated image.
    async fn upsert_cal_image_meta(&self, meta: &CalImageMetaRow) -> RegistryResult<()>;

    /// Get the spatial sidecar of a calibrated image.
    async fn get_cal_image_meta(&self, rid: i64) -> RegistryResult<Option<CalImageMetaRow>>;

    /// Cone-search candidates for overlap selection: best-version, visible
    /// calibrated images of the given filter whose fine tag is in
    /// `fine_tags` and whose center lies within `radius_deg` of
    /// (ra0, dec0). Ordered by angular distance from the search center.
    ///
    /// The tag list is an index prune, not an exact test; the caller
    /// applies the footprint refinement.
    async fn overlap_candidates(
        &self,
        fid: i16,
        ra0: f64,
        dec0: f64,
        radius_deg: f64,
        fine_tags: &[i64],
    ) -> RegistryResult<Vec<OverlapCandidateRow>>;
}
