//! Shared fixtures for registry integration tests.

use nocturn_core::tags::{COARSE_TAG_LEVEL, FINE_TAG_LEVEL, nested_tag};
use nocturn_core::{SkyCoord, TileId};
use nocturn_registry::SqliteStore;
use nocturn_registry::models::CalImageMetaRow;
use nocturn_registry::repos::{
    CalImageRepo, ExposureRepo, NewCalImage, NewExposure, NewJob, NewRefImage,
};
use tempfile::TempDir;
use time::OffsetDateTime;
use time::macros::datetime;

/// Half-width of a synthetic detector footprint, degrees.
pub const HALF_SIZE_DEG: f64 = 0.06;

/// Open a fresh SQLite-backed store in a temp directory. The TempDir must
/// outlive the store.
pub async fn sqlite_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("registry.db"))
        .await
        .unwrap();
    (dir, store)
}

pub fn sample_dateobs() -> OffsetDateTime {
    datetime!(2028-09-08 00:18:00 UTC)
}

pub fn sample_exposure(field: TileId, fid: i16, mjdobs: f64) -> NewExposure {
    NewExposure {
        dateobs: sample_dateobs(),
        mjdobs,
        field,
        fid,
        exptime: 55.0,
        infobits: 0,
        status: 1,
    }
}

pub fn sample_cal_image(expid: i64, chipid: i16, field: TileId, fid: i16, mjdobs: f64) -> NewCalImage {
    NewCalImage {
        expid,
        chipid,
        field,
        fid,
        dateobs: sample_dateobs(),
        mjdobs,
        exptime: 55.0,
        infobits: 0,
        filename: format!("cal_e{expid}_c{chipid}.fits"),
        checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        status: 1,
        crval1: 150.0,
        crval2: 20.0,
        crpix1: 2048.0,
        crpix2: 2048.0,
        cd11: -3.06e-5,
        cd12: 0.0,
        cd21: 0.0,
        cd22: 3.06e-5,
        ctype1: "RA---TAN".to_string(),
        ctype2: "DEC--TAN".to_string(),
        ra: 150.0,
        dec: 20.0,
        equinox: 2000.0,
        zptmag: 26.3,
        skymean: 11.2,
    }
}

pub fn sample_ref_image(ppid: i32, field: TileId, fid: i16) -> NewRefImage {
    NewRefImage {
        ppid,
        field,
        fid,
        infobits: 0,
        filename: format!("refimage_f{field}_fid{fid}.fits"),
        checksum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
    }
}

pub fn sample_job(ppid: i32, proc_date: &str) -> NewJob {
    NewJob {
        ppid,
        fid: Some(4),
        expid: None,
        field: Some(7001),
        rid: None,
        rfid: None,
        proc_date: proc_date.to_string(),
        launched_at: sample_dateobs(),
    }
}

/// Spatial sidecar for a detector footprint centered at (ra, dec).
pub fn meta_for(rid: i64, field: TileId, fid: i16, ra: f64, dec: f64) -> CalImageMetaRow {
    let center = SkyCoord::new(ra, dec).unwrap();
    let [x, y, z] = center.unit_vector();
    CalImageMetaRow {
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
    }
}

/// Register, finalize, and promote a calibrated image with its sidecar so
/// it is visible to best/overlap queries. Returns its rid.
pub async fn visible_cal_image(
    store: &SqliteStore,
    chipid: i16,
    field: TileId,
    fid: i16,
    ra: f64,
    dec: f64,
    mjdobs: f64,
) -> i64 {
    let expid = store
        .add_exposure(&sample_exposure(field, fid, mjdobs))
        .await
        .unwrap();
    let new = sample_cal_image(expid, chipid, field, fid, mjdobs);
    let (rid, version) = store.register_cal_image(&new).await.unwrap();
    store
        .finalize_cal_image(rid, version, &new.filename, &new.checksum, 1)
        .await
        .unwrap();
    store
        .promote_best_cal_image(expid, chipid, rid)
        .await
        .unwrap();
    store
        .upsert_cal_image_meta(&meta_for(rid, field, fid, ra, dec))
        .await
        .unwrap();
    rid
}
