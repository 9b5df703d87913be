use std::sync::Arc;

use crate::adapters::Simulator;
use crate::config::AppConfig;
use crate::core::batching::BatchingController;
use crate::core::registry::KindRegistry;
use crate::core::store::ResourceStore;

/// Shared handles passed to the controllers and the RPC server.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<KindRegistry>,
    pub store: Arc<dyn ResourceStore>,
    pub backups: BatchingController,
    pub restores: BatchingController,
    pub simulator: Option<Simulator>,
}

impl AppContext {
    pub fn new(config: AppConfig, registry: Arc<KindRegistry>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            backups: BatchingController::new(config.max_concurrent_backups),
            restores: BatchingController::new(config.max_concurrent_restores),
            config: Arc::new(config),
            registry,
            store,
            simulator: None,
        }
    }

    pub fn with_simulator(mut self, simulator: Simulator) -> Self {
        self.simulator = Some(simulator);
        self
    }
}
