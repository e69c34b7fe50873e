//! Exposure repository.

use crate::error::RegistryResult;
use crate::models::ExposureRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Attributes of an exposure at ingestion time.
#[derive(Debug, Clone)]
pub struct NewExposure {
    pub dateobs: OffsetDateTime,
    pub mjdobs: f64,
    pub field: i64,
    pub fid: i16,
    pub exptime: f64,
    pub infobits: i32,
    pub status: i16,
}

/// Repository for exposure records. Exposures are created once at
/// ingestion and never versioned.
#[async_trait]
pub trait ExposureRepo: Send + Sync {
    /// Insert an exposure and return its id.
    async fn add_exposure(&self, exposure: &NewExposure) -> RegistryResult<i64>;

    /// Get an exposure by id.
    async fn get_exposure(&self, expid: i64) -> RegistryResult<Option<ExposureRow>>;

    /// Exposures observed within [start, end), ordered by dateobs. These
    /// are the eligible inputs of a science-stage launch.
    async fn exposures_in_window(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> RegistryResult<Vec<ExposureRow>>;
}
