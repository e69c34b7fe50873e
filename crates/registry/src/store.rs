//! Registry store trait and the SQLite implementation.

use crate::error::{RegistryError, RegistryResult};
use crate::models::*;
use crate::repos::{
    CalImageRepo, DiffImageRepo, ExposureRepo, JobRepo, NewCalImage, NewDiffImage, NewExposure,
    NewJob, NewRefImage, RefImageRepo,
};
use crate::versioning::{
    CAL_IMAGES, DIFF_IMAGES, ProductKind, REF_IMAGES, SqlDialect, is_retryable,
    is_unique_violation, promotion_conflict,
};
use async_trait::async_trait;
use nocturn_core::config::RetryConfig;
use nocturn_core::{JobOutcome, JobStatus, SkyCoord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined registry store trait.
#[async_trait]
pub trait RegistryStore:
    ExposureRepo + CalImageRepo + RefImageRepo + DiffImageRepo + JobRepo + Send + Sync
{
    /// Apply the embedded schema.
    async fn migrate(&self) -> RegistryResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> RegistryResult<()>;
}

/// SQL schema for SQLite (embedded).
const SQLITE_SCHEMA: &str = include_str!("sqlite_schema.sql");

/// Split an embedded schema into individual statements; neither backend
/// accepts multiple statements in one prepared statement.
pub(crate) fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// SQLite-based registry store.
///
/// A single pooled connection: SQLite permits limited write concurrency,
/// and one connection avoids persistent "database is locked" failures when
/// workers share the store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    promotion_retry: RetryConfig,
}

impl SqliteStore {
    /// Create a new SQLite store, applying the schema.
    pub async fn new(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Config(format!("cannot create {parent:?}: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            promotion_retry: RetryConfig::default(),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Override the bounded-backoff policy used for contended writes.
    pub fn with_promotion_retry(mut self, retry: RetryConfig) -> Self {
        self.promotion_retry = retry;
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn next_version(
        tx: &mut Transaction<'_, Sqlite>,
        kind: &ProductKind,
        key: &[i64],
    ) -> RegistryResult<i32> {
        let sql = kind.next_version_sql(SqlDialect::Sqlite);
        let mut q = sqlx::query_scalar::<_, i32>(&sql);
        for v in key {
            q = q.bind(v);
        }
        Ok(q.fetch_one(&mut **tx).await?)
    }

    /// One promotion attempt: demote the rest of the chain, then set the
    /// winner, in a single transaction.
    async fn try_promote(&self, kind: &ProductKind, key: &[i64], id: i64) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        let demote = kind.demote_others_sql(SqlDialect::Sqlite);
        let mut q = sqlx::query(&demote);
        for v in key {
            q = q.bind(v);
        }
        q.bind(id).execute(&mut *tx).await?;

        let promote = kind.promote_sql(SqlDialect::Sqlite);
        let result = sqlx::query(&promote).bind(id).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RegistryError::NotFound(format!(
                "{} id {id}",
                kind.table
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn promote_with_retry(
        &self,
        kind: &ProductKind,
        key: &[i64],
        id: i64,
    ) -> RegistryResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_promote(kind, key, id).await {
                Ok(()) => return Ok(()),
                Err(RegistryError::Database(e)) if is_retryable(&e) => {
                    if attempt >= self.promotion_retry.max_attempts {
                        return Err(promotion_conflict(kind, key, attempt));
                    }
                    let backoff = self.promotion_retry.backoff_ms(attempt);
                    tracing::warn!(
                        table = kind.table,
                        id,
                        attempt,
                        backoff_ms = backoff,
                        "Promotion contended, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize_row(
        &self,
        kind: &ProductKind,
        id: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()> {
        let sql = kind.finalize_sql(SqlDialect::Sqlite);
        let result = sqlx::query(&sql)
            .bind(filename)
            .bind(checksum)
            .bind(status)
            .bind(id)
            .bind(version)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(format!(
                "{} id {id} version {version}",
                kind.table
            )));
        }
        Ok(())
    }

    async fn select_best<R>(&self, kind: &ProductKind, key: &[i64]) -> RegistryResult<Option<R>>
    where
        R: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
    {
        let sql = kind.select_best_sql(SqlDialect::Sqlite);
        let mut q = sqlx::query_as::<_, R>(&sql);
        for v in key {
            q = q.bind(v);
        }
        Ok(q.fetch_optional(&self.pool).await?)
    }

    /// Retry wrapper for registrations: a concurrent writer can take our
    /// computed version, tripping the unique constraint; recompute and try
    /// again within the bounded policy.
    fn registration_exhausted(kind: &ProductKind, err: sqlx::Error) -> RegistryError {
        RegistryError::Registration(format!("insert into {} failed: {err}", kind.table))
    }
}

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn migrate(&self) -> RegistryResult<()> {
        for statement in schema_statements(SQLITE_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> RegistryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ExposureRepo for SqliteStore {
    async fn add_exposure(&self, exposure: &NewExposure) -> RegistryResult<i64> {
        let expid: i64 = sqlx::query_scalar(
            "INSERT INTO exposures (dateobs, mjdobs, field, fid, exptime, infobits, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING expid",
        )
        .bind(exposure.dateobs)
        .bind(exposure.mjdobs)
        .bind(exposure.field)
        .bind(exposure.fid)
        .bind(exposure.exptime)
        .bind(exposure.infobits)
        .bind(exposure.status)
        .fetch_one(&self.pool)
        .await?;
        Ok(expid)
    }

    async fn get_exposure(&self, expid: i64) -> RegistryResult<Option<ExposureRow>> {
        let row = sqlx::query_as::<_, ExposureRow>("SELECT * FROM exposures WHERE expid = ?")
            .bind(expid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn exposures_in_window(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> RegistryResult<Vec<ExposureRow>> {
        let rows = sqlx::query_as::<_, ExposureRow>(
            "SELECT * FROM exposures \
             WHERE dateobs >= ? AND dateobs < ? AND status > 0 ORDER BY dateobs",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl CalImageRepo for SqliteStore {
    async fn register_cal_image(&self, image: &NewCalImage) -> RegistryResult<(i64, i32)> {
        let key = [image.expid, image.chipid as i64];
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: RegistryResult<(i64, i32)> = async {
                let mut tx = self.pool.begin().await?;
                let version = Self::next_version(&mut tx, &CAL_IMAGES, &key).await?;
                let rid: i64 = sqlx::query_scalar(
                    "INSERT INTO cal_images (\
                         expid, chipid, field, fid, dateobs, mjdobs, exptime, infobits, \
                         filename, checksum, status, version, vbest, \
                         crval1, crval2, crpix1, crpix2, cd11, cd12, cd21, cd22, \
                         ctype1, ctype2, ra, dec, equinox, zptmag, skymean) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, \
                             ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     RETURNING rid",
                )
                .bind(image.expid)
                .bind(image.chipid)
                .bind(image.field)
                .bind(image.fid)
                .bind(image.dateobs)
                .bind(image.mjdobs)
                .bind(image.exptime)
                .bind(image.infobits)
                .bind(&image.filename)
                .bind(&image.checksum)
                .bind(image.status)
                .bind(version)
                .bind(image.crval1)
                .bind(image.crval2)
                .bind(image.crpix1)
                .bind(image.crpix2)
                .bind(image.cd11)
                .bind(image.cd12)
                .bind(image.cd21)
                .bind(image.cd22)
                .bind(&image.ctype1)
                .bind(&image.ctype2)
                .bind(image.ra)
                .bind(image.dec)
                .bind(image.equinox)
                .bind(image.zptmag)
                .bind(image.skymean)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok((rid, version))
            }
            .await;

            match result {
                Ok(out) => return Ok(out),
                Err(RegistryError::Database(e))
                    if (is_unique_violation(&e) || is_retryable(&e))
                        && attempt < self.promotion_retry.max_attempts =>
                {
                    tokio::time::sleep(Duration::from_millis(
                        self.promotion_retry.backoff_ms(attempt),
                    ))
                    .await;
                }
                Err(RegistryError::Database(e)) => {
                    return Err(Self::registration_exhausted(&CAL_IMAGES, e));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize_cal_image(
        &self,
        rid: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()> {
        self.finalize_row(&CAL_IMAGES, rid, version, filename, checksum, status)
            .await
    }

    async fn promote_best_cal_image(
        &self,
        expid: i64,
        chipid: i16,
        rid: i64,
    ) -> RegistryResult<()> {
        self.promote_with_retry(&CAL_IMAGES, &[expid, chipid as i64], rid)
            .await
    }

    async fn get_best_cal_image(
        &self,
        expid: i64,
        chipid: i16,
    ) -> RegistryResult<Option<CalImageRow>> {
        self.select_best(&CAL_IMAGES, &[expid, chipid as i64]).await
    }

    async fn get_cal_image(&self, rid: i64) -> RegistryResult<Option<CalImageRow>> {
        let row = sqlx::query_as::<_, CalImageRow>("SELECT * FROM cal_images WHERE rid = ?")
            .bind(rid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_cal_image_meta(&self, meta: &CalImageMetaRow) -> RegistryResult<()> {
        sqlx::query(
            "INSERT INTO cal_image_meta (\
                 rid, field, fid, ra0, dec0, ra1, dec1, ra2, dec2, ra3, dec3, ra4, dec4, \
                 x, y, z, hp6, hp9) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(rid) DO UPDATE SET \
                 field = excluded.field, fid = excluded.fid, \
                 ra0 = excluded.ra0, dec0 = excluded.dec0, \
                 ra1 = excluded.ra1, dec1 = excluded.dec1, \
                 ra2 = excluded.ra2, dec2 = excluded.dec2, \
                 ra3 = excluded.ra3, dec3 = excluded.dec3, \
                 ra4 = excluded.ra4, dec4 = excluded.dec4, \
                 x = excluded.x, y = excluded.y, z = excluded.z, \
                 hp6 = excluded.hp6, hp9 = excluded.hp9",
        )
        .bind(meta.rid)
        .bind(meta.field)
        .bind(meta.fid)
        .bind(meta.ra0)
        .bind(meta.dec0)
        .bind(meta.ra1)
        .bind(meta.dec1)
        .bind(meta.ra2)
        .bind(meta.dec2)
        .bind(meta.ra3)
        .bind(meta.dec3)
        .bind(meta.ra4)
        .bind(meta.dec4)
        .bind(meta.x)
        .bind(meta.y)
        .bind(meta.z)
        .bind(meta.hp6)
        .bind(meta.hp9)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cal_image_meta(&self, rid: i64) -> RegistryResult<Option<CalImageMetaRow>> {
        let row =
            sqlx::query_as::<_, CalImageMetaRow>("SELECT * FROM cal_image_meta WHERE rid = ?")
                .bind(rid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn overlap_candidates(
        &self,
        fid: i16,
        ra0: f64,
        dec0: f64,
        radius_deg: f64,
        fine_tags: &[i64],
    ) -> RegistryResult<Vec<OverlapCandidateRow>> {
        let center = SkyCoord::new(ra0, dec0)?;
        let [x, y, z] = center.unit_vector();
        let cos_radius = radius_deg.to_radians().cos();

        // Numbered placeholders so the dot product can repeat in ORDER BY.
        let mut sql = String::from(
            "SELECT c.rid, c.expid, c.chipid, c.field, c.fid, c.mjdobs, c.filename, \
                    m.ra0, m.dec0, m.ra1, m.dec1, m.ra2, m.dec2, m.ra3, m.dec3, m.ra4, m.dec4 \
             FROM cal_image_meta m JOIN cal_images c ON c.rid = m.rid \
             WHERE m.fid = ?1 AND c.status > 0 AND c.vbest = 1 \
               AND (m.x * ?2 + m.y * ?3 + m.z * ?4) >= ?5",
        );
        if !fine_tags.is_empty() {
            let placeholders: Vec<String> =
                (0..fine_tags.len()).map(|i| format!("?{}", i + 6)).collect();
            sql.push_str(&format!(" AND m.hp9 IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY (m.x * ?2 + m.y * ?3 + m.z * ?4) DESC, c.rid");

        let mut q = sqlx::query_as::<_, OverlapCandidateRow>(&sql)
            .bind(fid)
            .bind(x)
            .bind(y)
            .bind(z)
            .bind(cos_radius);
        for tag in fine_tags {
            q = q.bind(tag);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl RefImageRepo for SqliteStore {
    async fn register_ref_image(&self, image: &NewRefImage) -> RegistryResult<(i64, i32)> {
        let key = [image.ppid as i64, image.field, image.fid as i64];
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: RegistryResult<(i64, i32)> = async {
                let mut tx = self.pool.begin().await?;
                let version = Self::next_version(&mut tx, &REF_IMAGES, &key).await?;
                let rfid: i64 = sqlx::query_scalar(
                    "INSERT INTO ref_images (\
                         ppid, field, fid, version, vbest, status, infobits, filename, checksum) \
                     VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?) RETURNING rfid",
                )
                .bind(image.ppid)
                .bind(image.field)
                .bind(image.fid)
                .bind(version)
                .bind(image.infobits)
                .bind(&image.filename)
                .bind(&image.checksum)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok((rfid, version))
            }
            .await;

            match result {
                Ok(out) => return Ok(out),
                Err(RegistryError::Database(e))
                    if (is_unique_violation(&e) || is_retryable(&e))
                        && attempt < self.promotion_retry.max_attempts =>
                {
                    tokio::time::sleep(Duration::from_millis(
                        self.promotion_retry.backoff_ms(attempt),
                    ))
                    .await;
                }
                Err(RegistryError::Database(e)) => {
                    return Err(Self::registration_exhausted(&REF_IMAGES, e));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize_ref_image(
        &self,
        rfid: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()> {
        self.finalize_row(&REF_IMAGES, rfid, version, filename, checksum, status)
            .await
    }

    async fn promote_best_ref_image(
        &self,
        ppid: i32,
        field: i64,
        fid: i16,
        rfid: i64,
    ) -> RegistryResult<()> {
        self.promote_with_retry(&REF_IMAGES, &[ppid as i64, field, fid as i64], rfid)
            .await
    }

    async fn get_best_ref_image(
        &self,
        ppid: i32,
        field: i64,
        fid: i16,
    ) -> RegistryResult<Option<RefImageRow>> {
        self.select_best(&REF_IMAGES, &[ppid as i64, field, fid as i64])
            .await
    }

    async fn get_ref_image(&self, rfid: i64) -> RegistryResult<Option<RefImageRow>> {
        let row = sqlx::query_as::<_, RefImageRow>("SELECT * FROM ref_images WHERE rfid = ?")
            .bind(rfid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_ref_image_meta(&self, meta: &RefImageMetaRow) -> RegistryResult<()> {
        sqlx::query(
            "INSERT INTO ref_image_meta (\
                 rfid, nframes, mjdobsmin, mjdobsmax, cov5percent, fwhmmin, fwhmmedian, fwhmmax) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(rfid) DO UPDATE SET \
                 nframes = excluded.nframes, \
                 mjdobsmin = excluded.mjdobsmin, mjdobsmax = excluded.mjdobsmax, \
                 cov5percent = excluded.cov5percent, \
                 fwhmmin = excluded.fwhmmin, fwhmmedian = excluded.fwhmmedian, \
                 fwhmmax = excluded.fwhmmax",
        )
        .bind(meta.rfid)
        .bind(meta.nframes)
        .bind(meta.mjdobsmin)
        .bind(meta.mjdobsmax)
        .bind(meta.cov5percent)
        .bind(meta.fwhmmin)
        .bind(meta.fwhmmedian)
        .bind(meta.fwhmmax)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_ref_image_meta(&self, rfid: i64) -> RegistryResult<Option<RefImageMetaRow>> {
        let row =
            sqlx::query_as::<_, RefImageMetaRow>("SELECT * FROM ref_image_meta WHERE rfid = ?")
                .bind(rfid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }
}

#[async_trait]
impl DiffImageRepo for SqliteStore {
    async fn register_diff_image(&self, image: &NewDiffImage) -> RegistryResult<(i64, i32)> {
        let key = [image.rid, image.rfid];
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result: RegistryResult<(i64, i32)> = async {
                let mut tx = self.pool.begin().await?;
                let version = Self::next_version(&mut tx, &DIFF_IMAGES, &key).await?;
                let pid: i64 = sqlx::query_scalar(
                    "INSERT INTO diff_images (\
                         rid, rfid, ppid, version, vbest, status, filename, checksum, \
                         ra1, dec1, ra2, dec2, ra3, dec3, ra4, dec4) \
                     VALUES (?, ?, ?, ?, 0, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING pid",
                )
                .bind(image.rid)
                .bind(image.rfid)
                .bind(image.ppid)
                .bind(version)
                .bind(&image.filename)
                .bind(&image.checksum)
                .bind(image.ra1)
                .bind(image.dec1)
                .bind(image.ra2)
                .bind(image.dec2)
                .bind(image.ra3)
                .bind(image.dec3)
                .bind(image.ra4)
                .bind(image.dec4)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok((pid, version))
            }
            .await;

            match result {
                Ok(out) => return Ok(out),
                Err(RegistryError::Database(e))
                    if (is_unique_violation(&e) || is_retryable(&e))
                        && attempt < self.promotion_retry.max_attempts =>
                {
                    tokio::time::sleep(Duration::from_millis(
                        self.promotion_retry.backoff_ms(attempt),
                    ))
                    .await;
                }
                Err(RegistryError::Database(e)) => {
                    return Err(Self::registration_exhausted(&DIFF_IMAGES, e));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize_diff_image(
        &self,
        pid: i64,
        version: i32,
        filename: &str,
        checksum: &str,
        status: i16,
    ) -> RegistryResult<()> {
        self.finalize_row(&DIFF_IMAGES, pid, version, filename, checksum, status)
            .await
    }

    async fn promote_best_diff_image(&self, rid: i64, rfid: i64, pid: i64) -> RegistryResult<()> {
        self.promote_with_retry(&DIFF_IMAGES, &[rid, rfid], pid)
            .await
    }

    async fn get_best_diff_image(
        &self,
        rid: i64,
        rfid: i64,
    ) -> RegistryResult<Option<DiffImageRow>> {
        self.select_best(&DIFF_IMAGES, &[rid, rfid]).await
    }

    async fn get_diff_image(&self, pid: i64) -> RegistryResult<Option<DiffImageRow>> {
        let row = sqlx::query_as::<_, DiffImageRow>("SELECT * FROM diff_images WHERE pid = ?")
            .bind(pid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl JobRepo for SqliteStore {
    async fn create_job(&self, job: &NewJob) -> RegistryResult<i64> {
        let jid: i64 = sqlx::query_scalar(
            "INSERT INTO jobs (ppid, fid, expid, field, rid, rfid, status, proc_date, launched_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'created', ?, ?) RETURNING jid",
        )
        .bind(job.ppid)
        .bind(job.fid)
        .bind(job.expid)
        .bind(job.field)
        .bind(job.rid)
        .bind(job.rfid)
        .bind(&job.proc_date)
        .bind(job.launched_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(jid)
    }

    async fn get_job(&self, jid: i64) -> RegistryResult<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jid = ?")
            .bind(jid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn attach_external_id(&self, jid: i64, external_id: &str) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jid = ?")
            .bind(jid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("job {jid}")))?;

        match job.external_id.as_deref() {
            Some(existing) if existing == external_id => {
                // Already attached with the same value.
                tx.rollback().await?;
                return Ok(());
            }
            Some(existing) => {
                let existing = existing.to_string();
                tx.rollback().await?;
                return Err(RegistryError::ExternalIdConflict {
                    jid,
                    existing,
                    requested: external_id.to_string(),
                });
            }
            None => {}
        }

        sqlx::query("UPDATE jobs SET external_id = ?, status = 'submitted' WHERE jid = ?")
            .bind(external_id)
            .bind(jid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_job_status(&self, jid: i64, status: &str) -> RegistryResult<()> {
        let status = JobStatus::parse(status)?;
        let result = sqlx::query("UPDATE jobs SET status = ? WHERE jid = ? AND status <> 'closed_out'")
            .bind(status.as_str())
            .bind(jid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.get_job(jid).await? {
                None => Err(RegistryError::NotFound(format!("job {jid}"))),
                Some(job) => Err(RegistryError::InvalidStateTransition {
                    from: job.status,
                    to: status.as_str().to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn close_out_job(
        &self,
        jid: i64,
        exit_code: i32,
        external_id: Option<&str>,
        started_at: Option<OffsetDateTime>,
        ended_at: Option<OffsetDateTime>,
    ) -> RegistryResult<JobOutcome> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jid = ?")
            .bind(jid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("job {jid}")))?;

        if job.status == JobStatus::ClosedOut.as_str() {
            // Idempotent repeat: report the recorded outcome, touch nothing.
            tx.rollback().await?;
            let recorded = job
                .outcome
                .as_deref()
                .map(JobStatus::parse)
                .transpose()?
                .unwrap_or(JobStatus::Failed);
            tracing::debug!(jid, "Job already closed out");
            return Ok(match recorded {
                JobStatus::Succeeded => JobOutcome::Succeeded,
                JobStatus::NotEnoughInput => JobOutcome::NotEnoughInput,
                _ => JobOutcome::Failed,
            });
        }

        if let (Some(existing), Some(requested)) = (job.external_id.as_deref(), external_id)
            && existing != requested
        {
            let existing = existing.to_string();
            tx.rollback().await?;
            return Err(RegistryError::ExternalIdConflict {
                jid,
                existing,
                requested: requested.to_string(),
            });
        }

        let outcome = JobOutcome::from_exit_code(exit_code);
        sqlx::query(
            "UPDATE jobs SET \
                 external_id = COALESCE(external_id, ?), \
                 status = 'closed_out', outcome = ?, exit_code = ?, \
                 started_at = COALESCE(?, started_at), ended_at = ? \
             WHERE jid = ?",
        )
        .bind(external_id)
        .bind(outcome.terminal_status().as_str())
        .bind(exit_code)
        .bind(started_at)
        .bind(ended_at)
        .bind(jid)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(jid, exit_code, outcome = ?outcome, "Job closed out");
        Ok(outcome)
    }

    async fn unclosed_jobs_for_proc_date(
        &self,
        ppid: i32,
        proc_date: &str,
    ) -> RegistryResult<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs \
             WHERE ppid = ? AND proc_date = ? AND status <> 'closed_out' ORDER BY jid",
        )
        .bind(ppid)
        .bind(proc_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn jobs_for_proc_date(&self, ppid: i32, proc_date: &str) -> RegistryResult<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE ppid = ? AND proc_date = ? ORDER BY jid",
        )
        .bind(ppid)
        .bind(proc_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_split() {
        let statements = schema_statements(SQLITE_SCHEMA);
        assert!(statements.len() > 10);
        assert!(statements.iter().all(|s| !s.trim().is_empty()));
        assert!(
            statements
                .iter()
                .any(|s| s.contains("CREATE TABLE IF NOT EXISTS ref_images"))
        );
    }
}
