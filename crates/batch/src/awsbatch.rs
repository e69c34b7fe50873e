//! AWS Batch client.

use crate::client::{BatchClient, BatchJobStatus, ExternalJobId, JobSpec};
use crate::error::{BatchError, BatchResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_batch::Client;
use aws_sdk_batch::types::{ContainerOverrides, JobStatus, KeyValuePair};
use std::collections::HashMap;

/// Batch client backed by AWS Batch, using the ambient credential chain.
pub struct AwsBatchClient {
    client: Client,
}

impl AwsBatchClient {
    pub async fn new(region: Option<String>) -> BatchResult<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Ok(Self {
            client: Client::new(&config),
        })
    }

    fn map_status(status: &JobStatus) -> BatchResult<BatchJobStatus> {
        Ok(match status {
            JobStatus::Submitted => BatchJobStatus::Submitted,
            JobStatus::Pending => BatchJobStatus::Pending,
            JobStatus::Runnable => BatchJobStatus::Runnable,
            JobStatus::Starting => BatchJobStatus::Starting,
            JobStatus::Running => BatchJobStatus::Running,
            JobStatus::Succeeded => BatchJobStatus::Succeeded,
            JobStatus::Failed => BatchJobStatus::Failed,
            other => {
                return Err(BatchError::Transient(format!(
                    "unrecognized batch status: {other:?}"
                )));
            }
        })
    }
}

#[async_trait]
impl BatchClient for AwsBatchClient {
    async fn submit(&self, spec: &JobSpec) -> BatchResult<ExternalJobId> {
        let environment: Vec<KeyValuePair> = spec
            .environment
            .iter()
            .map(|(name, value)| {
                KeyValuePair::builder().name(name).value(value).build()
            })
            .collect();
        let overrides = ContainerOverrides::builder()
            .set_environment(Some(environment))
            .build();

        let response = self
            .client
            .submit_job()
            .job_name(&spec.name)
            .job_queue(&spec.queue)
            .job_definition(&spec.definition)
            .container_overrides(overrides)
            .send()
            .await
            .map_err(|e| BatchError::Submit(e.to_string()))?;

        let job_id = response
            .job_id()
            .ok_or_else(|| BatchError::Submit("no job id in submit response".to_string()))?;
        tracing::info!(external_id = %job_id, name = %spec.name, "Batch job submitted");
        Ok(ExternalJobId::new(job_id))
    }

    async fn describe(&self, ids: &[ExternalJobId]) -> BatchResult<Vec<BatchJobStatus>> {
        // Network and throttling failures here are transient: the poll
        // loop retries at its next sweep.
        let response = self
            .client
            .describe_jobs()
            .set_jobs(Some(
                ids.iter().map(|id| id.as_str().to_string()).collect(),
            ))
            .send()
            .await
            .map_err(|e| BatchError::Transient(e.to_string()))?;

        let mut by_id: HashMap<&str, &JobStatus> = HashMap::new();
        for job in response.jobs() {
            if let (Some(job_id), Some(status)) = (job.job_id(), job.status()) {
                by_id.insert(job_id, status);
            }
        }

        ids.iter()
            .map(|id| {
                let status = by_id
                    .get(id.as_str())
                    .ok_or_else(|| BatchError::UnknownJob(id.as_str().to_string()))?;
                Self::map_status(status)
            })
            .collect()
    }
}
