pub mod batching;
pub mod bridge;
pub mod cleanup;
pub mod controller;
pub mod error;
pub mod job;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
pub mod staging;
pub mod state_machine;
pub mod status;
pub mod store;

pub use batching::BatchingController;
pub use cleanup::{CleanupCoordinator, CleanupOutcome};
pub use controller::{Controller, ControllerSettings};
pub use error::{ReconcileError, StoreError};
pub use job::MoverJob;
pub use models::{BackupJob, JobRef, Phase, RestoreJob, StoredObject, VsbRef};
pub use orchestrator::Orchestrator;
pub use reconciler::{Reconciler, ReconcilerSettings};
pub use registry::KindRegistry;
pub use store::ResourceStore;
