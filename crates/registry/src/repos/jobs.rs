//! Job repository.

use crate::error::RegistryResult;
use crate::models::JobRow;
use async_trait::async_trait;
use nocturn_core::JobOutcome;
use time::OffsetDateTime;

/// Attributes of a job at creation time. A job row is created before the
/// external submission so that the external id can be attached as soon as
/// the batch service replies.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub ppid: i32,
    pub fid: Option<i16>,
    pub expid: Option<i64>,
    pub field: Option<i64>,
    pub rid: Option<i64>,
    pub rfid: Option<i64>,
    pub proc_date: String,
    pub launched_at: OffsetDateTime,
}

/// Repository for job lifecycle bookkeeping.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Create a job row in state `created`; returns its id.
    async fn create_job(&self, job: &NewJob) -> RegistryResult<i64>;

    /// Get a job by id.
    async fn get_job(&self, jid: i64) -> RegistryResult<Option<JobRow>>;

    /// Attach the external batch-job id and move the job to `submitted`.
    ///
    /// Idempotent when called again with the same value; attaching a
    /// different value is an `ExternalIdConflict` (the external id is
    /// immutable once set).
    async fn attach_external_id(&self, jid: i64, external_id: &str) -> RegistryResult<()>;

    /// Record the externally reported non-terminal status
    /// (runnable/starting/running) observed during polling.
    async fn update_job_status(&self, jid: i64, status: &str) -> RegistryResult<()>;

    /// Close out a job: record exit code, outcome, timestamps, and move it
    /// to `closed_out`.
    ///
    /// Idempotent: a second call on a closed-out job is a no-op returning
    /// the recorded outcome. Closing out a job that was never created is
    /// rejected with `NotFound`. If the job has no external id yet and one
    /// is supplied (e.g. recovered from the job's log artifact), it is
    /// recorded here so no closed job lacks one; supplying a different id
    /// than the attached one is a conflict.
    async fn close_out_job(
        &self,
        jid: i64,
        exit_code: i32,
        external_id: Option<&str>,
        started_at: Option<OffsetDateTime>,
        ended_at: Option<OffsetDateTime>,
    ) -> RegistryResult<JobOutcome>;

    /// Jobs of a pipeline for a processing date that have not been closed
    /// out yet. These are the jobs the poller sweeps.
    async fn unclosed_jobs_for_proc_date(
        &self,
        ppid: i32,
        proc_date: &str,
    ) -> RegistryResult<Vec<JobRow>>;

    /// All jobs of a pipeline for a processing date.
    async fn jobs_for_proc_date(&self, ppid: i32, proc_date: &str) -> RegistryResult<Vec<JobRow>>;
}
