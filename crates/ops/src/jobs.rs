//! Job lifecycle manager.
//!
//! Creates job rows, attaches external ids, polls the batch service until
//! a whole set of jobs is terminal, and performs closeout bookkeeping.

use crate::error::{OpsError, OpsResult};
use nocturn_batch::{BatchClient, BatchJobStatus, ExternalJobId, JobSpec};
use nocturn_core::config::{BatchConfig, RetryConfig};
use nocturn_core::{JobOutcome, JobStatus};
use nocturn_registry::RegistryStore;
use nocturn_registry::repos::NewJob;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

/// Job lifecycle manager over the registry and the batch client.
pub struct JobLifecycle {
    registry: Arc<dyn RegistryStore>,
    batch: Arc<dyn BatchClient>,
    poll_interval: Duration,
    describe_retry: RetryConfig,
}

impl JobLifecycle {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        batch: Arc<dyn BatchClient>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            registry,
            batch,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            describe_retry: config.describe_retry.clone(),
        }
    }

    /// Create a job row in the registry.
    pub async fn create(&self, job: &NewJob) -> OpsResult<i64> {
        Ok(self.registry.create_job(job).await?)
    }

    /// Submit a job spec to the batch service and attach the returned
    /// external id. The attach is the last step, so a crash between submit
    /// and attach leaves a `created` row that closeout can reconcile from
    /// the job's log artifact.
    pub async fn submit(&self, jid: i64, spec: &JobSpec) -> OpsResult<ExternalJobId> {
        let external_id = self.batch.submit(spec).await?;
        self.registry
            .attach_external_id(jid, external_id.as_str())
            .await?;
        tracing::info!(jid, external_id = %external_id, name = %spec.name, "Job submitted");
        Ok(external_id)
    }

    /// Idempotently attach an external id observed out-of-band.
    pub async fn attach_external_id(&self, jid: i64, external_id: &str) -> OpsResult<()> {
        Ok(self.registry.attach_external_id(jid, external_id).await?)
    }

    /// Poll the batch service until every job in the set is terminal.
    ///
    /// A sweep queries all jobs; if any is non-terminal the whole call
    /// sleeps one interval and sweeps again, so one slow job delays
    /// readiness for the entire batch (an accepted characteristic of the
    /// design, kept deliberately). Transient describe failures retry at
    /// sweep cadence, bounded by the configured number of consecutive
    /// failures; `cancel` is checked once per sweep.
    ///
    /// Returns the final externally reported status per job id.
    pub async fn poll_until_terminal(
        &self,
        jids: &[i64],
        cancel: &AtomicBool,
    ) -> OpsResult<HashMap<i64, BatchJobStatus>> {
        if jids.is_empty() {
            return Ok(HashMap::new());
        }

        // Resolve external ids once; jobs without one cannot make progress
        // and poll forever, so their absence is a registry error here.
        let mut external_ids = Vec::with_capacity(jids.len());
        for &jid in jids {
            let job = self
                .registry
                .get_job(jid)
                .await?
                .ok_or_else(|| nocturn_registry::RegistryError::NotFound(format!("job {jid}")))?;
            let external_id = job.external_id.ok_or_else(|| {
                nocturn_registry::RegistryError::Internal(format!(
                    "job {jid} polled without an external id"
                ))
            })?;
            external_ids.push(ExternalJobId::new(external_id));
        }

        let mut consecutive_failures = 0u32;
        let mut sweep = 0u64;
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(OpsError::Interrupted);
            }
            sweep += 1;

            match self.batch.describe(&external_ids).await {
                Ok(statuses) => {
                    consecutive_failures = 0;

                    let mut final_statuses = HashMap::with_capacity(jids.len());
                    let mut n_terminal = 0;
                    for (&jid, &status) in jids.iter().zip(statuses.iter()) {
                        if status.is_terminal() {
                            n_terminal += 1;
                        } else {
                            self.record_polled_status(jid, status).await?;
                        }
                        final_statuses.insert(jid, status);
                    }

                    tracing::debug!(
                        sweep,
                        n_terminal,
                        n_total = jids.len(),
                        "Polling sweep complete"
                    );

                    if n_terminal == jids.len() {
                        // Record terminal statuses before returning.
                        for (&jid, status) in &final_statuses {
                            let terminal = match status {
                                BatchJobStatus::Succeeded => JobStatus::Succeeded,
                                _ => JobStatus::Failed,
                            };
                            self.registry
                                .update_job_status(jid, terminal.as_str())
                                .await?;
                        }
                        return Ok(final_statuses);
                    }
                }
                Err(err) if err.is_transient() => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.describe_retry.max_attempts {
                        return Err(OpsError::PollingExhausted {
                            sweeps: consecutive_failures,
                            source: err,
                        });
                    }
                    tracing::warn!(
                        sweep,
                        consecutive_failures,
                        error = %err,
                        "Transient status-query failure, will retry next sweep"
                    );
                }
                Err(err) => return Err(err.into()),
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn record_polled_status(&self, jid: i64, status: BatchJobStatus) -> OpsResult<()> {
        let mapped = match status {
            BatchJobStatus::Runnable => Some(JobStatus::Runnable),
            BatchJobStatus::Starting => Some(JobStatus::Starting),
            BatchJobStatus::Running => Some(JobStatus::Running),
            // Submitted/Pending precede our runnable window; the row
            // already says `submitted`.
            _ => None,
        };
        if let Some(status) = mapped {
            self.registry
                .update_job_status(jid, status.as_str())
                .await?;
        }
        Ok(())
    }

    /// Closeout bookkeeping; idempotent (see the repository contract).
    pub async fn close_out(
        &self,
        jid: i64,
        exit_code: i32,
        external_id: Option<&str>,
        started_at: Option<OffsetDateTime>,
        ended_at: Option<OffsetDateTime>,
    ) -> OpsResult<JobOutcome> {
        Ok(self
            .registry
            .close_out_job(jid, exit_code, external_id, started_at, ended_at)
            .await?)
    }
}
