//! Shared fixtures for control-plane integration tests: a small but total
//! sky tessellation around (150, 20), a SQLite registry, in-memory object
//! storage, and the scripted batch fake.

use nocturn_batch::InProcessBatch;
use nocturn_core::config::{AppConfig, BatchConfig, RetryConfig};
use nocturn_core::tags::{COARSE_TAG_LEVEL, FINE_TAG_LEVEL, nested_tag};
use nocturn_core::{SkyCoord, SkyTile, TessellationIndex};
use nocturn_ops::OpsContext;
use nocturn_registry::SqliteStore;
use nocturn_registry::models::CalImageMetaRow;
use nocturn_registry::repos::{NewCalImage, NewExposure};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use time::macros::datetime;

/// Tile id of the 0.2 x 0.2 degree target tile centered at (150, 20).
pub const TARGET_FIELD: i64 = 3;

pub const FID: i16 = 4;

/// Half-width of a synthetic detector footprint, degrees.
pub const HALF_SIZE_DEG: f64 = 0.06;

/// Total partition with a narrow declination band around dec=20 split so
/// that tile 3 is a realistic-size target tile.
pub fn test_tessellation() -> TessellationIndex {
    let tiles = vec![
        SkyTile::from_bounds(1, 0.0, 360.0, -90.0, 19.9).unwrap(),
        SkyTile::from_bounds(2, 0.0, 149.9, 19.9, 20.1).unwrap(),
        SkyTile::from_bounds(TARGET_FIELD, 149.9, 150.1, 19.9, 20.1).unwrap(),
        SkyTile::from_bounds(4, 150.1, 360.0, 19.9, 20.1).unwrap(),
        SkyTile::from_bounds(5, 0.0, 360.0, 20.1, 90.0).unwrap(),
    ];
    TessellationIndex::from_tiles(tiles).unwrap()
}

/// Configuration tuned for tests: zero-length poll sleeps and millisecond
/// backoffs.
pub fn test_config() -> AppConfig {
    AppConfig {
        batch: BatchConfig {
            job_queue: "test-queue".to_string(),
            job_definition: "test-science:1".to_string(),
            postproc_job_definition: "test-postproc:1".to_string(),
            poll_interval_secs: 0,
            describe_retry: RetryConfig {
                max_attempts: 4,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
            },
            ..BatchConfig::default()
        },
        ..AppConfig::default()
    }
}

/// Assemble a context over fresh fakes. The TempDir must outlive the
/// context.
pub async fn test_context() -> (TempDir, Arc<OpsContext>, Arc<InProcessBatch>) {
    let dir = tempfile::tempdir().unwrap();
    let registry = SqliteStore::new(dir.path().join("registry.db"))
        .await
        .unwrap()
        .with_promotion_retry(RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        });
    let batch = Arc::new(InProcessBatch::new());
    let ctx = Arc::new(OpsContext::new(
        Arc::new(registry),
        Arc::new(nocturn_storage::MemoryBackend::new()),
        batch.clone(),
        Arc::new(test_tessellation()),
        test_config(),
    ));
    (dir, ctx, batch)
}

pub fn window() -> (OffsetDateTime, OffsetDateTime) {
    (
        datetime!(2028-09-08 00:00:00 UTC),
        datetime!(2028-09-09 00:00:00 UTC),
    )
}

pub const PROC_DATE: &str = "20280908";

/// Register, finalize, and promote a calibrated image centered at
/// (ra, dec) with its spatial sidecar; returns its rid.
pub async fn visible_cal_image(
    ctx: &OpsContext,
    chipid: i16,
    field: i64,
    fid: i16,
    ra: f64,
    dec: f64,
    mjdobs: f64,
) -> i64 {
    let expid = ctx
        .registry
        .add_exposure(&NewExposure {
            dateobs: datetime!(2028-09-08 00:18:00 UTC),
            mjdobs,
            field,
            fid,
            exptime: 55.0,
            infobits: 0,
            status: 1,
        })
        .await
        .unwrap();

    let new = NewCalImage {
        expid,
        chipid,
        field,
        fid,
        dateobs: datetime!(2028-09-08 00:18:00 UTC),
        mjdobs,
        exptime: 55.0,
        infobits: 0,
        filename: format!("cal_e{expid}_c{chipid}.fits"),
        checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        status: 1,
        crval1: ra,
        crval2: dec,
        crpix1: 2048.0,
        crpix2: 2048.0,
        cd11: -3.06e-5,
        cd12: 0.0,
        cd21: 0.0,
        cd22: 3.06e-5,
        ctype1: "RA---TAN".to_string(),
        ctype2: "DEC--TAN".to_string(),
        ra,
        dec,
        equinox: 2000.0,
        zptmag: 26.3,
        skymean: 11.2,
    };
    let (rid, version) = ctx.registry.register_cal_image(&new).await.unwrap();
    ctx.registry
        .finalize_cal_image(rid, version, &new.filename, &new.checksum, 1)
        .await
        .unwrap();
    ctx.registry
        .promote_best_cal_image(expid, chipid, rid)
        .await
        .unwrap();

    let center = SkyCoord::new(ra, dec).unwrap();
    let [x, y, z] = center.unit_vector();
    ctx.registry
        .upsert_cal_image_meta(&CalImageMetaRow {
            rid,
            field,
            fid,
            ra0: ra,
            dec0: dec,
            ra1: ra - HALF_SIZE_DEG,
            dec1: dec - HALF_SIZE_DEG,
            ra2: ra + HALF_SIZE_DEG,
            dec2: dec - HALF_SIZE_DEG,
            ra3: ra + HALF_SIZE_DEG,
            dec3: dec + HALF_SIZE_DEG,
            ra4: ra - HALF_SIZE_DEG,
            dec4: dec + HALF_SIZE_DEG,
            x,
            y,
            z,
            hp6: nested_tag(&center, COARSE_TAG_LEVEL).unwrap() as i64,
            hp9: nested_tag(&center, FINE_TAG_LEVEL).unwrap() as i64,
        })
        .await
        .unwrap();
    rid
}

/// Seed one eligible exposure for the science stage.
pub async fn seed_exposure(ctx: &OpsContext, mjdobs: f64) -> i64 {
    ctx.registry
        .add_exposure(&NewExposure {
            dateobs: datetime!(2028-09-08 00:18:00 UTC),
            mjdobs,
            field: TARGET_FIELD,
            fid: FID,
            exptime: 55.0,
            infobits: 0,
            status: 1,
        })
        .await
        .unwrap()
}
