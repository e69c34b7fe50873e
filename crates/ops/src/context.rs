//! Explicit operations context.
//!
//! All shared handles live here and are passed into every operation; no
//! module holds process-global connection state. This keeps workers free
//! of hidden cross-worker coupling and lets tests assemble a context from
//! in-process fakes.

use crate::error::{OpsError, OpsResult};
use nocturn_batch::BatchClient;
use nocturn_core::TessellationIndex;
use nocturn_core::config::AppConfig;
use nocturn_registry::RegistryStore;
use nocturn_registry::repos::load_sky_tiles;
use nocturn_storage::ObjectStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared handles for one control-plane process.
pub struct OpsContext {
    pub registry: Arc<dyn RegistryStore>,
    pub storage: Arc<dyn ObjectStore>,
    pub batch: Arc<dyn BatchClient>,
    pub tessellation: Arc<TessellationIndex>,
    pub config: AppConfig,
    stop: Arc<AtomicBool>,
}

impl OpsContext {
    /// Assemble a context from already constructed components.
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        storage: Arc<dyn ObjectStore>,
        batch: Arc<dyn BatchClient>,
        tessellation: Arc<TessellationIndex>,
        config: AppConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            batch,
            tessellation,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the production context from configuration: registry store,
    /// object store, and the tessellation index loaded once from its
    /// read-only table.
    pub async fn from_config(config: AppConfig, batch: Arc<dyn BatchClient>) -> OpsResult<Self> {
        let registry = nocturn_registry::from_config(&config.registry).await?;
        let storage = nocturn_storage::from_config(&config.storage).await?;

        let tess_config = config.tessellation.as_ref().ok_or_else(|| {
            OpsError::Config("tessellation store path is required".to_string())
        })?;
        let tessellation = Arc::new(load_sky_tiles(&tess_config.path).await?);

        registry.health_check().await?;
        storage.health_check().await?;

        Ok(Self::new(registry, storage, batch, tessellation, config))
    }

    /// Request a cooperative stop; checked between outer-loop iterations
    /// and between polling sweeps, never mid-operation.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Shared stop flag, for signal handlers and the polling loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}
