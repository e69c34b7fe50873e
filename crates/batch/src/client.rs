//! Batch client trait and wire types.

use crate::error::BatchResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifier assigned by the external batch service at submission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalJobId(String);

impl ExternalJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExternalJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Externally reported job status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchJobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl BatchJobStatus {
    /// Whether the batch service will report no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Pending => "PENDING",
            Self::Runnable => "RUNNABLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

/// Specification of one batch job: where it runs and the environment
/// parameters the containerized pipeline reads its inputs from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub queue: String,
    pub definition: String,
    /// Environment overrides passed into the container.
    pub environment: Vec<(String, String)>,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            definition: definition.into(),
            environment: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }
}

/// External batch-compute service client.
#[async_trait]
pub trait BatchClient: Send + Sync + 'static {
    /// Submit a job; returns the external id assigned by the service.
    async fn submit(&self, spec: &JobSpec) -> BatchResult<ExternalJobId>;

    /// Describe the current status of the given jobs, in input order.
    async fn describe(&self, ids: &[ExternalJobId]) -> BatchResult<Vec<BatchJobStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(BatchJobStatus::Succeeded.is_terminal());
        assert!(BatchJobStatus::Failed.is_terminal());
        for status in [
            BatchJobStatus::Submitted,
            BatchJobStatus::Pending,
            BatchJobStatus::Runnable,
            BatchJobStatus::Starting,
            BatchJobStatus::Running,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_job_spec_env_builder() {
        let spec = JobSpec::new("science_20280908_jid7", "ops-queue", "pipeline:4")
            .env("JOBPROCDATE", "20280908")
            .env("JID", "7");
        assert_eq!(spec.environment.len(), 2);
        assert_eq!(spec.environment[0].0, "JOBPROCDATE");
    }
}
