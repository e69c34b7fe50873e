//! In-process batch service fake with scripted status sequences.

use crate::client::{BatchClient, BatchJobStatus, ExternalJobId, JobSpec};
use crate::error::{BatchError, BatchResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

struct FakeState {
    counter: u64,
    /// Remaining status sequence per job; the last element is sticky.
    scripts: HashMap<String, VecDeque<BatchJobStatus>>,
    /// Number of upcoming describe calls that fail transiently.
    describe_failures: u32,
    submitted: Vec<JobSpec>,
}

/// Scripted in-process stand-in for the external batch service.
///
/// Each submitted job gets a status script; every describe sweep consumes
/// one entry per job and the final entry repeats forever. The default
/// script is a short Running -> Succeeded run; tests override per job.
pub struct InProcessBatch {
    state: Mutex<FakeState>,
    default_script: Vec<BatchJobStatus>,
}

impl InProcessBatch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                counter: 0,
                scripts: HashMap::new(),
                describe_failures: 0,
                submitted: Vec::new(),
            }),
            default_script: vec![BatchJobStatus::Running, BatchJobStatus::Succeeded],
        }
    }

    /// Replace the script used for subsequently submitted jobs.
    pub fn with_default_script(mut self, script: Vec<BatchJobStatus>) -> Self {
        assert!(!script.is_empty(), "script must not be empty");
        self.default_script = script;
        self
    }

    /// Override the remaining script of an already submitted job.
    pub fn set_script(&self, id: &ExternalJobId, script: Vec<BatchJobStatus>) {
        assert!(!script.is_empty(), "script must not be empty");
        let mut state = self.state.lock().unwrap();
        state.scripts.insert(id.as_str().to_string(), script.into());
    }

    /// Make the next `n` describe calls fail transiently.
    pub fn fail_next_describes(&self, n: u32) {
        self.state.lock().unwrap().describe_failures = n;
    }

    /// Job specs submitted so far, in order.
    pub fn submitted(&self) -> Vec<JobSpec> {
        self.state.lock().unwrap().submitted.clone()
    }
}

impl Default for InProcessBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchClient for InProcessBatch {
    async fn submit(&self, spec: &JobSpec) -> BatchResult<ExternalJobId> {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let id = format!("fake-batch-{:06}", state.counter);
        state
            .scripts
            .insert(id.clone(), self.default_script.clone().into());
        state.submitted.push(spec.clone());
        tracing::debug!(external_id = %id, name = %spec.name, "Fake batch job submitted");
        Ok(ExternalJobId::new(id))
    }

    async fn describe(&self, ids: &[ExternalJobId]) -> BatchResult<Vec<BatchJobStatus>> {
        let mut state = self.state.lock().unwrap();

        if state.describe_failures > 0 {
            state.describe_failures -= 1;
            return Err(BatchError::Transient(
                "injected describe failure".to_string(),
            ));
        }

        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            let script = state
                .scripts
                .get_mut(id.as_str())
                .ok_or_else(|| BatchError::UnknownJob(id.as_str().to_string()))?;
            let status = if script.len() > 1 {
                script.pop_front().expect("non-empty script")
            } else {
                *script.front().expect("non-empty script")
            };
            statuses.push(status);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_progression_with_sticky_terminal() {
        let batch = InProcessBatch::new();
        let id = batch
            .submit(&JobSpec::new("job", "q", "d"))
            .await
            .unwrap();
        batch.set_script(
            &id,
            vec![
                BatchJobStatus::Runnable,
                BatchJobStatus::Running,
                BatchJobStatus::Succeeded,
            ],
        );

        let ids = [id];
        assert_eq!(
            batch.describe(&ids).await.unwrap(),
            vec![BatchJobStatus::Runnable]
        );
        assert_eq!(
            batch.describe(&ids).await.unwrap(),
            vec![BatchJobStatus::Running]
        );
        for _ in 0..3 {
            assert_eq!(
                batch.describe(&ids).await.unwrap(),
                vec![BatchJobStatus::Succeeded]
            );
        }
    }

    #[tokio::test]
    async fn test_describe_failure_injection() {
        let batch = InProcessBatch::new();
        let id = batch.submit(&JobSpec::new("job", "q", "d")).await.unwrap();
        batch.fail_next_describes(2);

        let ids = [id];
        assert!(batch.describe(&ids).await.unwrap_err().is_transient());
        assert!(batch.describe(&ids).await.unwrap_err().is_transient());
        assert!(batch.describe(&ids).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let batch = InProcessBatch::new();
        let err = batch
            .describe(&[ExternalJobId::new("nope")])
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::UnknownJob(_)));
    }
}
