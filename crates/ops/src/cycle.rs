//! Pipeline control loop.
//!
//! A cycle for one processing date runs two stages, each a hard
//! synchronization point: launch jobs for eligible inputs, wait until
//! every job of the stage is terminal, then register results. No
//! post-processing work begins until all science jobs are terminal.

use crate::artifacts::{
    self, DeclaredProducts, config_key, job_name, log_key, parse_job_log, products_key,
};
use crate::context::OpsContext;
use crate::error::{OpsError, OpsResult};
use crate::jobs::JobLifecycle;
use crate::selector::{EpochFilter, select_coadd_inputs};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use nocturn_batch::JobSpec;
use nocturn_core::JobOutcome;
use nocturn_core::exitcode;
use nocturn_registry::RegistryError;
use nocturn_registry::models::{ExposureRow, JobRow, RefImageMetaRow};
use nocturn_registry::repos::{NewDiffImage, NewJob, NewRefImage};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

/// Outcome counts for one stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageReport {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_enough_input: usize,
}

/// Outcome of one full cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleReport {
    pub science: StageReport,
    pub postproc: StageReport,
}

/// The repeatable daily cycle, single-threaded at the stage level with
/// bounded fan-out inside each stage.
pub struct PipelineCycle {
    ctx: Arc<OpsContext>,
    lifecycle: JobLifecycle,
}

impl PipelineCycle {
    pub fn new(ctx: Arc<OpsContext>) -> Self {
        let lifecycle = JobLifecycle::new(
            ctx.registry.clone(),
            ctx.batch.clone(),
            &ctx.config.batch,
        );
        Self { ctx, lifecycle }
    }

    pub fn lifecycle(&self) -> &JobLifecycle {
        &self.lifecycle
    }

    /// One-shot cycle for a given processing date: science stage, then
    /// post-processing, each fully terminal before the next begins.
    pub async fn run_for_date(
        &self,
        proc_date: &str,
        window: (OffsetDateTime, OffsetDateTime),
    ) -> OpsResult<CycleReport> {
        let cancel = self.ctx.stop_handle();
        let started = Instant::now();

        let science_jids = self.launch_science_jobs(proc_date, window).await?;
        tracing::info!(
            proc_date,
            n_jobs = science_jids.len(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "Science stage launched"
        );

        self.lifecycle
            .poll_until_terminal(&science_jids, &cancel)
            .await?;
        let science = self
            .harvest_stage(self.ctx.config.cycle.science_pipeline_id, proc_date)
            .await?;
        tracing::info!(
            proc_date,
            ?science,
            elapsed_s = started.elapsed().as_secs_f64(),
            "Science stage registered"
        );

        let postproc_jids = self.launch_postproc_jobs(proc_date).await?;
        self.lifecycle
            .poll_until_terminal(&postproc_jids, &cancel)
            .await?;
        let postproc = self
            .harvest_stage(self.ctx.config.cycle.postproc_pipeline_id, proc_date)
            .await?;
        tracing::info!(
            proc_date,
            ?postproc,
            elapsed_s = started.elapsed().as_secs_f64(),
            "Cycle complete"
        );

        Ok(CycleReport { science, postproc })
    }

    /// Continuous mode: one cycle per iteration for the current date,
    /// with the stop flag checked only between iterations.
    pub async fn run_loop(&self, window: (OffsetDateTime, OffsetDateTime)) -> OpsResult<()> {
        loop {
            let proc_date = proc_date_today();
            self.run_for_date(&proc_date, window).await?;

            if self.ctx.stop_requested() {
                tracing::info!("Stop requested, terminating after completed cycle");
                return Err(OpsError::Interrupted);
            }

            tokio::time::sleep(std::time::Duration::from_secs(
                self.ctx.config.cycle.loop_sleep_secs,
            ))
            .await;

            if self.ctx.stop_requested() {
                return Err(OpsError::Interrupted);
            }
        }
    }

    /// Launch one science job per eligible exposure, fanned out across the
    /// bounded worker pool. Per-job precondition failures are fatal to that
    /// job only; siblings proceed.
    async fn launch_science_jobs(
        &self,
        proc_date: &str,
        window: (OffsetDateTime, OffsetDateTime),
    ) -> OpsResult<Vec<i64>> {
        let exposures = self
            .ctx
            .registry
            .exposures_in_window(window.0, window.1)
            .await?;
        tracing::info!(proc_date, n_exposures = exposures.len(), "Launching science jobs");

        let jids: Vec<Option<i64>> = stream::iter(exposures)
            .map(|exposure| self.launch_one_science_job(proc_date, exposure))
            .buffer_unordered(self.ctx.config.cycle.worker_pool_size)
            .collect()
            .await;

        Ok(jids.into_iter().flatten().collect())
    }

    async fn launch_one_science_job(
        &self,
        proc_date: &str,
        exposure: ExposureRow,
    ) -> Option<i64> {
        match self.try_launch_science_job(proc_date, &exposure).await {
            Ok(jid) => Some(jid),
            Err(err) => {
                tracing::error!(
                    expid = exposure.expid,
                    field = exposure.field,
                    error = %err,
                    "Science job launch failed; siblings unaffected"
                );
                None
            }
        }
    }

    async fn try_launch_science_job(
        &self,
        proc_date: &str,
        exposure: &ExposureRow,
    ) -> OpsResult<i64> {
        let cycle_cfg = &self.ctx.config.cycle;
        let field = exposure.field;
        let fid = exposure.fid;

        // The tessellation is authoritative: the exposure's recorded tile
        // must exist in the loaded table.
        self.ctx.tessellation.tile(field)?;

        // Reference image: reuse the best version, or register a
        // provisional one for this job to build.
        let best_ref = self
            .ctx
            .registry
            .get_best_ref_image(cycle_cfg.refimage_pipeline_id, field, fid)
            .await?;

        let (ref_info, coadd_inputs, job_rfid) = match &best_ref {
            Some(ref_image) => ((Some((ref_image.filename.clone(), ref_image.rfid))), Vec::new(), Some(ref_image.rfid)),
            None => {
                let mut inputs = select_coadd_inputs(
                    self.ctx.registry.as_ref(),
                    &self.ctx.tessellation,
                    field,
                    fid,
                    EpochFilter::Before(exposure.mjdobs),
                    None,
                    self.ctx.config.selector.cone_radius_deg,
                )
                .await?;
                inputs.truncate(self.ctx.config.selector.max_coadd_inputs);

                let new_ref = NewRefImage {
                    ppid: cycle_cfg.refimage_pipeline_id,
                    field,
                    fid,
                    infobits: 0,
                    filename: format!("refimage_f{field}_fid{fid}.fits"),
                    checksum: String::new(),
                };
                let (rfid, version) = self.ctx.registry.register_ref_image(&new_ref).await?;
                tracing::info!(
                    rfid,
                    version,
                    field,
                    fid,
                    n_inputs = inputs.len(),
                    "Provisional reference image registered"
                );
                (None, inputs, Some(rfid))
            }
        };

        let jid = self
            .lifecycle
            .create(&NewJob {
                ppid: cycle_cfg.science_pipeline_id,
                fid: Some(fid),
                expid: Some(exposure.expid),
                field: Some(field),
                rid: None,
                rfid: job_rfid,
                proc_date: proc_date.to_string(),
                launched_at: OffsetDateTime::now_utc(),
            })
            .await?;

        let name = job_name(&self.ctx.config.batch.job_name_base, proc_date, jid);
        let config_text = artifacts::render_science_config(
            proc_date,
            jid,
            field,
            fid,
            ref_info.as_ref().map(|(filename, rfid)| (filename.as_str(), *rfid)),
            &coadd_inputs,
            &cycle_cfg.product_bucket,
        );
        self.ctx
            .storage
            .put(
                &cycle_cfg.job_info_bucket,
                &config_key(proc_date, &name),
                Bytes::from(config_text),
            )
            .await?;

        let mut spec = JobSpec::new(
            &name,
            &self.ctx.config.batch.job_queue,
            &self.ctx.config.batch.job_definition,
        )
        .env("JID", jid.to_string())
        .env("JOBPROCDATE", proc_date.to_string())
        .env("EXPID", exposure.expid.to_string())
        .env("FIELD", field.to_string())
        .env("FID", fid.to_string());
        if let Some(rfid) = job_rfid {
            spec = spec.env("RFID", rfid.to_string());
        }

        match self.lifecycle.submit(jid, &spec).await {
            Ok(_) => Ok(jid),
            Err(err) => {
                // The row exists but nothing runs externally: close it out
                // now so the stage cannot stall on it.
                tracing::error!(jid, error = %err, "Submission failed, closing job out as failed");
                self.lifecycle
                    .close_out(
                        jid,
                        exitcode::CONFIG_ERROR,
                        None,
                        None,
                        Some(OffsetDateTime::now_utc()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// One post-processing job per sky tile touched by the date's
    /// successful science jobs.
    async fn launch_postproc_jobs(&self, proc_date: &str) -> OpsResult<Vec<i64>> {
        let cycle_cfg = &self.ctx.config.cycle;
        let science_jobs = self
            .ctx
            .registry
            .jobs_for_proc_date(cycle_cfg.science_pipeline_id, proc_date)
            .await?;

        let fields: BTreeSet<(i64, i16)> = science_jobs
            .iter()
            .filter(|job| job.outcome.as_deref() == Some("succeeded"))
            .filter_map(|job| Some((job.field?, job.fid?)))
            .collect();
        tracing::info!(proc_date, n_fields = fields.len(), "Launching postproc jobs");

        let jids: Vec<Option<i64>> = stream::iter(fields)
            .map(|(field, fid)| async move {
                match self.try_launch_postproc_job(proc_date, field, fid).await {
                    Ok(jid) => Some(jid),
                    Err(err) => {
                        tracing::error!(field, error = %err, "Postproc job launch failed");
                        None
                    }
                }
            })
            .buffer_unordered(cycle_cfg.worker_pool_size)
            .collect()
            .await;

        Ok(jids.into_iter().flatten().collect())
    }

    async fn try_launch_postproc_job(
        &self,
        proc_date: &str,
        field: i64,
        fid: i16,
    ) -> OpsResult<i64> {
        let cycle_cfg = &self.ctx.config.cycle;
        let jid = self
            .lifecycle
            .create(&NewJob {
                ppid: cycle_cfg.postproc_pipeline_id,
                fid: Some(fid),
                expid: None,
                field: Some(field),
                rid: None,
                rfid: None,
                proc_date: proc_date.to_string(),
                launched_at: OffsetDateTime::now_utc(),
            })
            .await?;

        let name = job_name(
            &self.ctx.config.batch.postproc_job_name_base,
            proc_date,
            jid,
        );
        let spec = JobSpec::new(
            &name,
            &self.ctx.config.batch.job_queue,
            &self.ctx.config.batch.postproc_job_definition,
        )
        .env("JID", jid.to_string())
        .env("JOBPROCDATE", proc_date.to_string())
        .env("FIELD", field.to_string())
        .env("FID", fid.to_string());

        match self.lifecycle.submit(jid, &spec).await {
            Ok(_) => Ok(jid),
            Err(err) => {
                self.lifecycle
                    .close_out(
                        jid,
                        exitcode::CONFIG_ERROR,
                        None,
                        None,
                        Some(OffsetDateTime::now_utc()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// Register stage results: harvest log artifacts, close out every
    /// remaining job, and record declared products of successful ones.
    async fn harvest_stage(&self, ppid: i32, proc_date: &str) -> OpsResult<StageReport> {
        let jobs = self
            .ctx
            .registry
            .jobs_for_proc_date(ppid, proc_date)
            .await?;

        let outcomes: Vec<OpsResult<JobOutcome>> = stream::iter(&jobs)
            .map(|job| self.harvest_one_job(proc_date, job))
            .buffer_unordered(self.ctx.config.cycle.worker_pool_size)
            .collect()
            .await;

        let mut report = StageReport {
            launched: jobs.len(),
            ..StageReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(JobOutcome::Succeeded) => report.succeeded += 1,
                Ok(JobOutcome::NotEnoughInput) => report.not_enough_input += 1,
                Ok(JobOutcome::Failed) => report.failed += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(error = %err, "Job harvest failed");
                }
            }
        }
        Ok(report)
    }

    async fn harvest_one_job(&self, proc_date: &str, job: &JobRow) -> OpsResult<JobOutcome> {
        if job.status == "closed_out" {
            // Already reconciled (idempotent re-harvest or an early
            // submission failure).
            return Ok(self
                .lifecycle
                .close_out(job.jid, job.exit_code.unwrap_or(exitcode::CONFIG_ERROR), None, None, None)
                .await?);
        }

        let base = if job.ppid == self.ctx.config.cycle.postproc_pipeline_id {
            &self.ctx.config.batch.postproc_job_name_base
        } else {
            &self.ctx.config.batch.job_name_base
        };
        let name = job_name(base, proc_date, job.jid);

        // The log artifact declares the authoritative exit code and, if
        // the submitter died before attaching it, the external id.
        let summary = match self
            .ctx
            .storage
            .get(&self.ctx.config.cycle.job_logs_bucket, &log_key(proc_date, &name))
            .await
        {
            Ok(data) => parse_job_log(&String::from_utf8_lossy(&data)),
            Err(nocturn_storage::StorageError::NotFound { .. }) => Default::default(),
            Err(err) => return Err(err.into()),
        };

        let mut exit_code = summary.exit_code.unwrap_or(match job.status.as_str() {
            "succeeded" => exitcode::NORMAL,
            _ => exitcode::CONFIG_ERROR,
        });

        // Register declared products before closeout so a promotion
        // conflict can still mark the job failed.
        if exit_code == exitcode::NORMAL {
            if let Err(err) = self.register_declared_products(proc_date, &name, job).await {
                match err {
                    OpsError::Registry(RegistryError::PromotionConflict { ref key, attempts }) => {
                        tracing::error!(
                            jid = job.jid,
                            key = %key,
                            attempts,
                            "Promotion conflict exhausted retries; marking job failed"
                        );
                        exit_code = exitcode::REGISTRY_FAILURE;
                    }
                    other => return Err(other),
                }
            }
        }

        Ok(self
            .lifecycle
            .close_out(
                job.jid,
                exit_code,
                summary.external_id.as_deref(),
                None,
                Some(OffsetDateTime::now_utc()),
            )
            .await?)
    }

    /// Record a job's declared outputs into the registry without
    /// interpreting pixel content.
    async fn register_declared_products(
        &self,
        proc_date: &str,
        name: &str,
        job: &JobRow,
    ) -> OpsResult<()> {
        let manifest = match self
            .ctx
            .storage
            .get(
                &self.ctx.config.cycle.job_logs_bucket,
                &products_key(proc_date, name),
            )
            .await
        {
            Ok(data) => data,
            Err(nocturn_storage::StorageError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let declared: DeclaredProducts = serde_json::from_slice(&manifest)
            .map_err(|e| OpsError::Config(format!("invalid products manifest for jid {}: {e}", job.jid)))?;

        if let Some(ref_image) = declared.ref_image {
            self.ctx
                .registry
                .finalize_ref_image(
                    ref_image.rfid,
                    ref_image.version,
                    &ref_image.filename,
                    &ref_image.checksum,
                    1,
                )
                .await?;
            self.ctx
                .registry
                .upsert_ref_image_meta(&RefImageMetaRow {
                    rfid: ref_image.rfid,
                    nframes: ref_image.nframes,
                    mjdobsmin: ref_image.mjdobsmin,
                    mjdobsmax: ref_image.mjdobsmax,
                    cov5percent: ref_image.cov5percent,
                    fwhmmin: ref_image.fwhmmin,
                    fwhmmedian: ref_image.fwhmmedian,
                    fwhmmax: ref_image.fwhmmax,
                })
                .await?;

            let row = self
                .ctx
                .registry
                .get_ref_image(ref_image.rfid)
                .await?
                .ok_or_else(|| {
                    RegistryError::NotFound(format!("ref image {}", ref_image.rfid))
                })?;
            self.ctx
                .registry
                .promote_best_ref_image(row.ppid, row.field, row.fid, row.rfid)
                .await?;
            tracing::info!(rfid = row.rfid, version = row.version, "Reference image promoted");
        }

        if let Some(diff) = declared.diff_image {
            let (pid, version) = self
                .ctx
                .registry
                .register_diff_image(&NewDiffImage {
                    rid: diff.rid,
                    rfid: diff.rfid,
                    ppid: job.ppid,
                    filename: diff.filename.clone(),
                    checksum: diff.checksum.clone(),
                    ra1: diff.ra1,
                    dec1: diff.dec1,
                    ra2: diff.ra2,
                    dec2: diff.dec2,
                    ra3: diff.ra3,
                    dec3: diff.dec3,
                    ra4: diff.ra4,
                    dec4: diff.dec4,
                })
                .await?;
            self.ctx
                .registry
                .finalize_diff_image(pid, version, &diff.filename, &diff.checksum, 1)
                .await?;
            self.ctx
                .registry
                .promote_best_diff_image(diff.rid, diff.rfid, pid)
                .await?;
            tracing::info!(pid, version, "Difference image promoted");
        }

        Ok(())
    }
}

/// Today's processing date as YYYYMMDD.
pub fn proc_date_today() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_date_shape() {
        let date = proc_date_today();
        assert_eq!(date.len(), 8);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
    }
}
