//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Relational registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryConfig {
    Sqlite {
        path: PathBuf,
    },
    Postgres {
        /// Full connection URL; takes precedence over individual fields.
        url: Option<String>,
        host: Option<String>,
        port: Option<u16>,
        username: Option<String>,
        password: Option<String>,
        database: Option<String>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Server-side statement timeout, to prevent hung sweeps.
        statement_timeout_ms: Option<u64>,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("data/registry.db"),
        }
    }
}

/// Location of the immutable sky-tessellation table (read-only SQLite).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TessellationConfig {
    pub path: PathBuf,
}

/// Object storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local directory tree, bucket = top-level subdirectory.
    Filesystem { root: PathBuf },
    /// In-process map, for tests and dry runs.
    Memory,
    /// S3-compatible object storage.
    S3 {
        region: String,
        /// Custom endpoint for S3-compatible services.
        endpoint: Option<String>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            root: PathBuf::from("data/objects"),
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (1-based), doubling up to the cap.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        (self.initial_backoff_ms.saturating_mul(factor)).min(self.max_backoff_ms)
    }
}

/// Which batch-compute client to construct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchProvider {
    /// AWS Batch via the ambient credential chain.
    Aws,
    /// Scripted in-process fake, for tests and dry runs.
    #[default]
    InProcess,
}

/// Batch-compute service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub provider: BatchProvider,
    /// Region for the AWS provider.
    pub region: Option<String>,
    pub job_queue: String,
    pub job_definition: String,
    #[serde(default = "default_job_name_base")]
    pub job_name_base: String,
    pub postproc_job_definition: String,
    #[serde(default = "default_postproc_job_name_base")]
    pub postproc_job_name_base: String,
    /// Sleep between status sweeps while any job of a batch is non-terminal.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Retry policy for transient describe failures. A deliberate bound
    /// over the source system's unbounded loop.
    #[serde(default)]
    pub describe_retry: RetryConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            provider: BatchProvider::default(),
            region: None,
            job_queue: String::new(),
            job_definition: String::new(),
            job_name_base: default_job_name_base(),
            postproc_job_definition: String::new(),
            postproc_job_name_base: default_postproc_job_name_base(),
            poll_interval_secs: default_poll_interval_secs(),
            describe_retry: RetryConfig::default(),
        }
    }
}

/// Overlap selector configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Initial cone-search radius in degrees; larger than one tile so
    /// corner-only overlaps are not missed.
    #[serde(default = "default_cone_radius_deg")]
    pub cone_radius_deg: f64,
    /// Cap on coaddition inputs taken from the head of the ordered list.
    #[serde(default = "default_max_coadd_inputs")]
    pub max_coadd_inputs: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            cone_radius_deg: default_cone_radius_deg(),
            max_coadd_inputs: default_max_coadd_inputs(),
        }
    }
}

/// Control-loop configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_science_pipeline_id")]
    pub science_pipeline_id: i32,
    #[serde(default = "default_refimage_pipeline_id")]
    pub refimage_pipeline_id: i32,
    #[serde(default = "default_postproc_pipeline_id")]
    pub postproc_pipeline_id: i32,
    /// Bounded fan-out for job submission and result harvesting.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Sleep between outer-loop iterations in continuous mode.
    #[serde(default = "default_loop_sleep_secs")]
    pub loop_sleep_secs: u64,
    /// Bucket for per-job config artifacts.
    #[serde(default = "default_job_info_bucket")]
    pub job_info_bucket: String,
    /// Bucket for per-job log artifacts.
    #[serde(default = "default_job_logs_bucket")]
    pub job_logs_bucket: String,
    /// Bucket for pixel-data products.
    #[serde(default = "default_product_bucket")]
    pub product_bucket: String,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            science_pipeline_id: default_science_pipeline_id(),
            refimage_pipeline_id: default_refimage_pipeline_id(),
            postproc_pipeline_id: default_postproc_pipeline_id(),
            worker_pool_size: default_worker_pool_size(),
            loop_sleep_secs: default_loop_sleep_secs(),
            job_info_bucket: default_job_info_bucket(),
            job_logs_bucket: default_job_logs_bucket(),
            product_bucket: default_product_bucket(),
        }
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    pub tessellation: Option<TessellationConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
}

fn default_max_connections() -> u32 {
    16
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_job_name_base() -> String {
    "science_pipeline".to_string()
}

fn default_postproc_job_name_base() -> String {
    "postproc_pipeline".to_string()
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_cone_radius_deg() -> f64 {
    crate::DEFAULT_CONE_SEARCH_RADIUS_DEG
}

fn default_max_coadd_inputs() -> usize {
    48
}

fn default_science_pipeline_id() -> i32 {
    15
}

fn default_refimage_pipeline_id() -> i32 {
    12
}

fn default_postproc_pipeline_id() -> i32 {
    17
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_loop_sleep_secs() -> u64 {
    30
}

fn default_job_info_bucket() -> String {
    "job-info".to_string()
}

fn default_job_logs_bucket() -> String {
    "job-logs".to_string()
}

fn default_product_bucket() -> String {
    "products".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 3_000,
        };
        assert_eq!(retry.backoff_ms(1), 500);
        assert_eq!(retry.backoff_ms(2), 1_000);
        assert_eq!(retry.backoff_ms(3), 2_000);
        assert_eq!(retry.backoff_ms(4), 3_000);
        assert_eq!(retry.backoff_ms(5), 3_000);
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert!(matches!(cfg.registry, RegistryConfig::Sqlite { .. }));
        assert_eq!(cfg.selector.cone_radius_deg, 0.18);
        assert_eq!(cfg.batch.poll_interval_secs, 60);
        assert_eq!(cfg.cycle.science_pipeline_id, 15);
    }
}
