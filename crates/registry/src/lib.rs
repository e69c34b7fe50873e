//! Versioned product registry for the Nocturn pipeline control plane.
//!
//! This crate provides the control-plane data model and stores:
//! - Exposures and calibrated images with spatial sidecars
//! - Reference and difference images with explicit version history
//! - Atomic "best version" promotion with bounded retry
//! - Job lifecycle bookkeeping
//! - The read-only sky-tessellation table loader

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;
pub mod versioning;

pub use error::{RegistryError, RegistryResult};
pub use postgres::PostgresStore;
pub use store::{RegistryStore, SqliteStore};

use nocturn_core::config::RegistryConfig;
use std::sync::Arc;

/// Create a registry store from configuration.
pub async fn from_config(config: &RegistryConfig) -> RegistryResult<Arc<dyn RegistryStore>> {
    match config {
        RegistryConfig::Sqlite { path } => {
            let store = SqliteStore::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn RegistryStore>)
        }
        RegistryConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            max_connections,
            statement_timeout_ms,
        } => {
            let store = if let Some(url) = url {
                tracing::info!("Connecting to PostgreSQL registry using connection URL");
                PostgresStore::from_url(url, *max_connections).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *max_connections,
                    *statement_timeout_ms,
                )
                .await?
            } else {
                return Err(RegistryError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn RegistryStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nocturn_core::config::RegistryConfig;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("registry.db");

        let config = RegistryConfig::Sqlite {
            path: db_path.clone(),
        };
        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
