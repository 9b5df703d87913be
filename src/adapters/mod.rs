use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{AppConfig, StoreBackend};
use crate::core::registry::KindRegistry;
use crate::core::store::ResourceStore;
use crate::db;

pub mod memory;
pub mod simulated;

pub use memory::MemoryStore;
pub use simulated::{SimulatedDataMover, Simulator};

/// Build the store backend selected by the configuration.
pub async fn create_store(
    config: &AppConfig,
    registry: Arc<KindRegistry>,
) -> Result<Arc<dyn ResourceStore>> {
    match config.store {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new(registry)))
        }
        StoreBackend::Sqlite => {
            let conn = db::init(&config.database_path).await.with_context(|| {
                format!("Failed to open database {}", config.database_path.display())
            })?;
            info!(path = %config.database_path.display(), "Using SQLite store");
            Ok(Arc::new(db::SqliteStore::new(conn, registry)))
        }
    }
}
