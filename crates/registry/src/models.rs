//! Database models mapping to the registry schema.
//!
//! Statuses are smallints: 0 marks a provisional row, invisible to "best"
//! and overlap queries until finalized to a value >= 1. Spatial tags are
//! stored as BIGINT and must round-trip the values computed at
//! registration time verbatim.

use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Exposures
// =============================================================================

/// One telescope exposure, created once at ingestion.
#[derive(Debug, Clone, FromRow)]
pub struct ExposureRow {
    pub expid: i64,
    pub dateobs: OffsetDateTime,
    pub mjdobs: f64,
    pub field: i64,
    pub fid: i16,
    pub exptime: f64,
    pub infobits: i32,
    pub status: i16,
}

// =============================================================================
// Calibrated images (one per detector per exposure)
// =============================================================================

/// A processed single-detector image registered in the product registry.
///
/// Natural key: (expid, chipid). The WCS block is recorded as declared by
/// the calibration executable; the control plane does not interpret it.
#[derive(Debug, Clone, FromRow)]
pub struct CalImageRow {
    pub rid: i64,
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
    pub version: i32,
    pub vbest: i16,
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

/// Spatial-metadata sidecar for a calibrated image: center, four corners,
/// unit-sphere vector for cone searches, and the two spatial tags.
#[derive(Debug, Clone, FromRow)]
pub struct CalImageMetaRow {
    pub rid: i64,
    pub field: i64,
    pub fid: i16,
    pub ra0: f64,
    pub dec0: f64,
    pub ra1: f64,
    pub dec1: f64,
    pub ra2: f64,
    pub dec2: f64,
    pub ra3: f64,
    pub dec3: f64,
    pub ra4: f64,
    pub dec4: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub hp6: i64,
    pub hp9: i64,
}

/// Candidate row returned by the overlap cone-search query: the calibrated
/// image joined with its spatial sidecar.
#[derive(Debug, Clone, FromRow)]
pub struct OverlapCandidateRow {
    pub rid: i64,
    pub expid: i64,
    pub chipid: i16,
    pub field: i64,
    pub fid: i16,
    pub mjdobs: f64,
    pub filename: String,
    pub ra0: f64,
    pub dec0: f64,
    pub ra1: f64,
    pub dec1: f64,
    pub ra2: f64,
    pub dec2: f64,
    pub ra3: f64,
    pub dec3: f64,
    pub ra4: f64,
    pub dec4: f64,
}

// =============================================================================
// Reference images
// =============================================================================

/// A coadded reference image. Natural key: (ppid, field, fid).
#[derive(Debug, Clone, FromRow)]
pub struct RefImageRow {
    pub rfid: i64,
    pub ppid: i32,
    pub field: i64,
    pub fid: i16,
    pub version: i32,
    pub vbest: i16,
    pub status: i16,
    pub infobits: i32,
    pub filename: String,
    pub checksum: String,
}

/// Quality-metrics sidecar for a reference image.
#[derive(Debug, Clone, FromRow)]
pub struct RefImageMetaRow {
    pub rfid: i64,
    /// Number of input frames coadded.
    pub nframes: i32,
    /// Earliest and latest mjd of the contributing inputs.
    pub mjdobsmin: f64,
    pub mjdobsmax: f64,
    /// Fraction of the tile covered by at least five input frames.
    pub cov5percent: f64,
    pub fwhmmin: f64,
    pub fwhmmedian: f64,
    pub fwhmmax: f64,
}

// =============================================================================
// Difference images
// =============================================================================

/// Result of subtracting a reference image from a calibrated image.
/// Natural key: (rid, rfid).
#[derive(Debug, Clone, FromRow)]
pub struct DiffImageRow {
    pub pid: i64,
    pub rid: i64,
    pub rfid: i64,
    pub ppid: i32,
    pub version: i32,
    pub vbest: i16,
    pub status: i16,
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

// =============================================================================
// Jobs
// =============================================================================

/// One pipeline job submitted to the external batch-compute service.
///
/// The external id is attached once after submission and is immutable
/// thereafter. Rows become immutable after closeout.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub jid: i64,
    pub ppid: i32,
    pub fid: Option<i16>,
    pub expid: Option<i64>,
    pub field: Option<i64>,
    pub rid: Option<i64>,
    pub rfid: Option<i64>,
    pub external_id: Option<String>,
    pub status: String,
    pub outcome: Option<String>,
    pub exit_code: Option<i32>,
    pub proc_date: String,
    pub launched_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
}

// =============================================================================
// Sky tiles (read-only reference table)
// =============================================================================

/// One row of the immutable sky-tessellation table.
#[derive(Debug, Clone, FromRow)]
pub struct SkyTileRow {
    pub tile_id: i64,
    pub ramin: f64,
    pub ramax: f64,
    pub decmin: f64,
    pub decmax: f64,
    pub cra: f64,
    pub cdec: f64,
    pub hp6: i64,
    pub hp9: i64,
}
