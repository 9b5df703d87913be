use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::adapters::SimulatedDataMover;
use crate::context::AppContext;
use crate::core::controller::{Controller, ControllerSettings};
use crate::core::models::{BackupJob, RestoreJob};
use crate::core::notifications;
use crate::core::reconciler::{Reconciler, ReconcilerSettings};
use crate::rpc::RpcServer;

/// Wires the backup and restore controllers, the optional simulated transfer
/// engine and the RPC server together.
pub struct Orchestrator {
    ctx: AppContext,
}

/// A started daemon.
pub struct Running {
    pub ctx: AppContext,
    pub rpc_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Start everything and run until `shutdown` is cancelled or a component
    /// fails.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        self.spawn(shutdown).await?.wait().await
    }

    /// Start every component in the background.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<Running> {
        let mut ctx = self.ctx;
        let config = ctx.config.clone();
        let mut tasks = JoinSet::new();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            store = ?config.store,
            simulation = config.simulation,
            "snapmover daemon starting"
        );

        if config.simulation {
            let (mover, simulator) =
                SimulatedDataMover::new(ctx.store.clone(), config.simulated_transfer());
            ctx = ctx.with_simulator(simulator);
            let token = shutdown.clone();
            tasks.spawn(async move {
                mover.run(token).await;
                Ok(())
            });
        }

        let notifier = notifications::create_notifier(&config.notifications);
        let reconciler_settings = ReconcilerSettings {
            verify_cleanup: config.verify_cleanup,
            conflict_retries: config.conflict_retries,
            poll_interval: config.poll_interval(),
            ..ReconcilerSettings::default()
        };
        let controller_settings = ControllerSettings {
            workers: config.workers,
            resync_interval: config.resync_interval(),
            error_backoff: config.error_backoff(),
            max_error_backoff: config.max_error_backoff(),
        };

        let backups = Controller::new(
            ctx.store.clone(),
            Reconciler::<BackupJob>::new(
                ctx.store.clone(),
                ctx.backups.clone(),
                reconciler_settings.clone(),
            )
            .with_notifier(notifier.clone()),
            controller_settings.clone(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move { backups.run(token).await.context("backup controller failed") });

        let restores = Controller::new(
            ctx.store.clone(),
            Reconciler::<RestoreJob>::new(ctx.store.clone(), ctx.restores.clone(), reconciler_settings)
                .with_notifier(notifier),
            controller_settings,
        );
        let token = shutdown.clone();
        tasks.spawn(async move { restores.run(token).await.context("restore controller failed") });

        let server = RpcServer::bind(ctx.clone(), config.rpc_addr()?)
            .await
            .with_context(|| format!("Failed to bind RPC server on {}", config.rpc_bind))?;
        let rpc_addr = server.local_addr()?;
        let token = shutdown.clone();
        tasks.spawn(async move { server.serve(token).await });

        Ok(Running {
            ctx,
            rpc_addr,
            shutdown,
            tasks,
        })
    }
}

impl Running {
    /// Wait for every component to stop. The first failure cancels the rest.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.context("daemon task panicked").and_then(|r| r);
            if let Err(e) = result {
                error!(error = %format!("{e:#}"), "Component stopped with an error");
                self.shutdown.cancel();
                first_error.get_or_insert(e);
            }
        }
        info!("snapmover daemon stopped");
        first_error.map_or(Ok(()), Err)
    }
}
