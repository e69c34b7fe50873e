//! PostgreSQL-based registry store implementation.

use crate::error::{RegistryError, RegistryResult};
use crate::models::*;
use crate::repos::{
    CalImageRepo, DiffImageRepo, ExposureRepo, JobRepo, NewCalImage, NewDiffImage, NewExposure,
    NewJob, NewRefImage, RefImageRepo,
};
use crate::store::{RegistryStore, schema_statements};
use crate::versioning::{
    CAL_IMAGES, DIFF_IMAGES, ProductKind, REF_IMAGES, SqlDialect, is_retryable,
    is_unique_violation, promotion_conflict,
};
use async_trait::async_trait;
use nocturn_core::config::RetryConfig;
use nocturn_core::{JobOutcome, JobStatus, SkyCoord};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// SQL schema for PostgreSQL (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// PostgreSQL-based registry store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
    promotion_retry: RetryConfig,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(url: &str, max_connections: u32) -> RegistryResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, None).await
    }

    /// Create a new PostgreSQL store from individual connection parameters,
    /// so credentials can come from the environment rather than a URL.
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> RegistryResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);
        if let Some(user) = username {
            opts = opts.username(user);
        }
        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        tracing::info!(host, port, database, "Connecting to PostgreSQL registry");
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> RegistryResult<Self> {
        // A statement timeout keeps a wedged query from stalling a whole
        // stage.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{timeout_ms}ms"))]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
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

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn next_version(
        tx: &mut Transaction<'_, Postgres>,
        kind: &ProductKind,
        key: &[i64],
    ) -> RegistryResult<i32> {
        let sql = kind.next_version_sql(SqlDialect::Postgres);
        let mut q = sqlx::query_scalar::<_, i32>(&sql);
        for v in key {
            q = q.bind(v);
        }
        Ok(q.fetch_one(&mut **tx).await?)
    }

    /// One promotion attempt. The chain is locked row-by-row with
    /// SELECT ... FOR UPDATE so two promoters serialize; the loser's
    /// demote/promote then sees the winner's committed state.
    async fn try_promote(&self, kind: &ProductKind, key: &[i64], id: i64) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        let lock = kind.lock_chain_sql();
        let mut q = sqlx::query(&lock);
        for v in key {
            q = q.bind(v);
        }
        q.fetch_all(&mut *tx).await?;

        let demote = kind.demote_others_sql(SqlDialect::Postgres);
        let mut q = sqlx::query(&demote);
        for v in key {
            q = q.bind(v);
        }
        q.bind(id).execute(&mut *tx).await?;

        let promote = kind.promote_sql(SqlDialect::Postgres);
        let result = sqlx::query(&promote).bind(id).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RegistryError::NotFound(format!("{} id {id}", kind.table)));
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
        let sql = kind.finalize_sql(SqlDialect::Postgres);
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
        R: for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> + Send + Unpin,
    {
        let sql = kind.select_best_sql(SqlDialect::Postgres);
        let mut q = sqlx::query_as::<_, R>(&sql);
        for v in key {
            q = q.bind(v);
        }
        Ok(q.fetch_optional(&self.pool).await?)
    }

    fn registration_exhausted(kind: &ProductKind, err: sqlx::Error) -> RegistryError {
        RegistryError::Registration(format!("insert into {} failed: {err}", kind.table))
    }
}

#[async_trait]
impl RegistryStore for PostgresStore {
    async fn migrate(&self) -> RegistryResult<()> {
        for statement in schema_statements(POSTGRES_SCHEMA) {
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
impl ExposureRepo for PostgresStore {
    async fn add_exposure(&self, exposure: &NewExposure) -> RegistryResult<i64> {
        let expid: i64 = sqlx::query_scalar(
            "INSERT INTO exposures (dateobs, mjdobs, field, fid, exptime, infobits, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING expid",
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
        let row = sqlx::query_as::<_, ExposureRow>("SELECT * FROM exposures WHERE expid = $1")
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
             WHERE dateobs >= $1 AND dateobs < $2 AND status > 0 ORDER BY dateobs",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl CalImageRepo for PostgresStore {
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
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0, \
                             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, \
                             $25, $26, $27) \
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
        let row = sqlx::query_as::<_, CalImageRow>("SELECT * FROM cal_images WHERE rid = $1")
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18) \
             ON CONFLICT(rid) DO UPDATE SET \
                 field = EXCLUDED.field, fid = EXCLUDED.fid, \
                 ra0 = EXCLUDED.ra0, dec0 = EXCLUDED.dec0, \
                 ra1 = EXCLUDED.ra1, dec1 = EXCLUDED.dec1, \
                 ra2 = EXCLUDED.ra2, dec2 = EXCLUDED.dec2, \
                 ra3 = EXCLUDED.ra3, dec3 = EXCLUDED.dec3, \
                 ra4 = EXCLUDED.ra4, dec4 = EXCLUDED.dec4, \
                 x = EXCLUDED.x, y = EXCLUDED.y, z = EXCLUDED.z, \
                 hp6 = EXCLUDED.hp6, hp9 = EXCLUDED.hp9",
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
            sqlx::query_as::<_, CalImageMetaRow>("SELECT * FROM cal_image_meta WHERE rid = $1")
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

        let mut sql = String::from(
            "SELECT c.rid, c.expid, c.chipid, c.field, c.fid, c.mjdobs, c.filename, \
                    m.ra0, m.dec0, m.ra1, m.dec1, m.ra2, m.dec2, m.ra3, m.dec3, m.ra4, m.dec4 \
             FROM cal_image_meta m JOIN cal_images c ON c.rid = m.rid \
             WHERE m.fid = $1 AND c.status > 0 AND c.vbest = 1 \
               AND (m.x * $2 + m.y * $3 + m.z * $4) >= $5",
        );
        if !fine_tags.is_empty() {
            let placeholders: Vec<String> =
                (0..fine_tags.len()).map(|i| format!("${}", i + 6)).collect();
            sql.push_str(&format!(" AND m.hp9 IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY (m.x * $2 + m.y * $3 + m.z * $4) DESC, c.rid");

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
impl RefImageRepo for PostgresStore {
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
                     VALUES ($1, $2, $3, $4, 0, 0, $5, $6, $7) RETURNING rfid",
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
        let row = sqlx::query_as::<_, RefImageRow>("SELECT * FROM ref_images WHERE rfid = $1")
            .bind(rfid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_ref_image_meta(&self, meta: &RefImageMetaRow) -> RegistryResult<()> {
        sqlx::query(
            "INSERT INTO ref_image_meta (\
                 rfid, nframes, mjdobsmin, mjdobsmax, cov5percent, fwhmmin, fwhmmedian, fwhmmax) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT(rfid) DO UPDATE SET \
                 nframes = EXCLUDED.nframes, \
                 mjdobsmin = EXCLUDED.mjdobsmin, mjdobsmax = EXCLUDED.mjdobsmax, \
                 cov5percent = EXCLUDED.cov5percent, \
                 fwhmmin = EXCLUDED.fwhmmin, fwhmmedian = EXCLUDED.fwhmmedian, \
                 fwhmmax = EXCLUDED.fwhmmax",
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
            sqlx::query_as::<_, RefImageMetaRow>("SELECT * FROM ref_image_meta WHERE rfid = $1")
                .bind(rfid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }
}

#[async_trait]
impl DiffImageRepo for PostgresStore {
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
                     VALUES ($1, $2, $3, $4, 0, 0, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                     RETURNING pid",
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
        let row = sqlx::query_as::<_, DiffImageRow>("SELECT * FROM diff_images WHERE pid = $1")
            .bind(pid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl JobRepo for PostgresStore {
    async fn create_job(&self, job: &NewJob) -> RegistryResult<i64> {
        let jid: i64 = sqlx::query_scalar(
            "INSERT INTO jobs (ppid, fid, expid, field, rid, rfid, status, proc_date, launched_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'created', $7, $8) RETURNING jid",
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
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jid = $1")
            .bind(jid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn attach_external_id(&self, jid: i64, external_id: &str) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jid = $1 FOR UPDATE")
            .bind(jid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("job {jid}")))?;

        match job.external_id.as_deref() {
            Some(existing) if existing == external_id => {
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

        sqlx::query("UPDATE jobs SET external_id = $1, status = 'submitted' WHERE jid = $2")
            .bind(external_id)
            .bind(jid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_job_status(&self, jid: i64, status: &str) -> RegistryResult<()> {
        let status = JobStatus::parse(status)?;
        let result = sqlx::query(
            "UPDATE jobs SET status = $1 WHERE jid = $2 AND status <> 'closed_out'",
        )
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

        let job = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE jid = $1 FOR UPDATE")
            .bind(jid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RegistryError::NotFound(format!("job {jid}")))?;

        if job.status == JobStatus::ClosedOut.as_str() {
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
                 external_id = COALESCE(external_id, $1), \
                 status = 'closed_out', outcome = $2, exit_code = $3, \
                 started_at = COALESCE($4, started_at), ended_at = $5 \
             WHERE jid = $6",
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
             WHERE ppid = $1 AND proc_date = $2 AND status <> 'closed_out' ORDER BY jid",
        )
        .bind(ppid)
        .bind(proc_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn jobs_for_proc_date(&self, ppid: i32, proc_date: &str) -> RegistryResult<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE ppid = $1 AND proc_date = $2 ORDER BY jid",
        )
        .bind(ppid)
        .bind(proc_date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
