//! Batch-compute service interface for Nocturn.
//!
//! The external batch service is a collaborator, not part of the control
//! plane: the contract is submit(job spec) -> external id and
//! describe(external ids) -> statuses. Production deployments run AWS
//! Batch; tests and dry runs use the scripted in-process fake.

pub mod awsbatch;
pub mod client;
pub mod error;
pub mod fake;

pub use awsbatch::AwsBatchClient;
pub use client::{BatchClient, BatchJobStatus, ExternalJobId, JobSpec};
pub use error::{BatchError, BatchResult};
pub use fake::InProcessBatch;

use nocturn_core::config::{BatchConfig, BatchProvider};
use std::sync::Arc;

/// Create a batch client from configuration.
pub async fn from_config(config: &BatchConfig) -> BatchResult<Arc<dyn BatchClient>> {
    match config.provider {
        BatchProvider::Aws => {
            let client = AwsBatchClient::new(config.region.clone()).await?;
            Ok(Arc::new(client))
        }
        BatchProvider::InProcess => Ok(Arc::new(InProcessBatch::new())),
    }
}
