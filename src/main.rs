use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use snapmover::config::{AppConfig, StoreBackend};
use snapmover::context::AppContext;
use snapmover::core::{KindRegistry, Orchestrator};
use snapmover::rpc::RpcClient;
use snapmover::rpc::methods::{DaemonStatus, JobKind, JobSummary};
use snapmover::{adapters, logging};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "snapmover")]
#[command(about = "Volume snapshot data mover controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon RPC address used by client commands (defaults to rpc_bind).
    #[arg(long, global = true)]
    rpc: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controllers and the RPC server.
    Daemon(ServerArgs),
    /// Show daemon health and admission state.
    Status,
    /// Inspect and delete jobs.
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Create a backup job.
    Backup(BackupArgs),
    /// Create a restore job.
    Restore(RestoreArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, value_enum)]
    store: Option<StoreBackend>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_backups: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent_restores: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    workers: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verify_cleanup: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_json: Option<bool>,
}

#[derive(Subcommand)]
enum JobsCommand {
    List {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<JobKind>,
        #[arg(long)]
        namespace: Option<String>,
    },
    Get(JobArgs),
    Delete(JobArgs),
}

#[derive(Args)]
struct JobArgs {
    #[arg(value_parser = parse_kind)]
    kind: JobKind,
    namespace: String,
    name: String,
}

#[derive(Args)]
struct BackupArgs {
    namespace: String,
    name: String,
    #[arg(long)]
    volume_snapshot_content: String,
    #[arg(long)]
    restic_secret: String,
    #[arg(long)]
    protected_namespace: String,
}

#[derive(Args)]
struct RestoreArgs {
    namespace: String,
    name: String,
    /// Backup job (in the same namespace) to restore from.
    #[arg(long)]
    from_backup: String,
    #[arg(long)]
    restic_secret: String,
    #[arg(long)]
    protected_namespace: String,
}

fn parse_kind(s: &str) -> Result<JobKind, String> {
    match s {
        "backup" | "vsb" => Ok(JobKind::Backup),
        "restore" | "vsr" => Ok(JobKind::Restore),
        other => Err(format!("unknown job kind {other:?} (expected backup or restore)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&ServerArgs>)?,
    };

    let rpc_addr = cli.rpc.clone().unwrap_or_else(|| config.rpc_bind.clone());
    let client = || -> Result<RpcClient> {
        let addr = rpc_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid RPC address {rpc_addr:?}"))?;
        Ok(RpcClient::new(addr))
    };

    match &cli.command {
        Commands::Daemon(_) => {
            logging::init(logging::LogConfig::from(&config));
            run_daemon(config).await.context("Failed to run daemon")?
        }
        Commands::Status => run_status(&client()?)
            .await
            .context("Failed to check status of daemon")?,
        Commands::Jobs(command) => run_jobs(&client()?, command).await?,
        Commands::Backup(args) => run_backup(&client()?, args).await?,
        Commands::Restore(args) => run_restore(&client()?, args).await?,
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = Arc::new(KindRegistry::with_defaults());
    let store = adapters::create_store(&config, registry.clone()).await?;
    let ctx = AppContext::new(config, registry, store);

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            token.cancel();
        }
    });

    Orchestrator::new(ctx).start(shutdown).await
}

async fn run_status(client: &RpcClient) -> Result<()> {
    let status: DaemonStatus = client.call_no_params("daemon.status").await?;
    println!("snapmover {} (up {}s)", status.version, status.uptime_secs);
    println!("store: {}  simulation: {}", status.store, status.simulation);
    for (label, batching) in [("backups", &status.backups), ("restores", &status.restores)] {
        println!(
            "{label}: {}/{} processing, {} queued",
            batching.processing.len(),
            batching.limit,
            batching.queued.len()
        );
    }
    Ok(())
}

async fn run_jobs(client: &RpcClient, command: &JobsCommand) -> Result<()> {
    match command {
        JobsCommand::List { kind, namespace } => {
            let rows: Vec<JobSummary> = client
                .call("jobs.list", Some(json!({ "kind": kind, "namespace": namespace })))
                .await?;
            println!(
                "{:<8} {:<16} {:<24} {:<20} {:<10} {:>6}",
                "KIND", "NAMESPACE", "NAME", "PHASE", "BATCHING", "AGE"
            );
            for row in rows {
                println!(
                    "{:<8} {:<16} {:<24} {:<20} {:<10} {:>6}",
                    format!("{:?}", row.kind).to_lowercase(),
                    row.namespace,
                    row.name,
                    row.phase.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    row.batching.map(|b| format!("{b:?}")).unwrap_or_else(|| "-".into()),
                    row.age_secs.map(|a| format!("{a}s")).unwrap_or_else(|| "-".into()),
                );
            }
        }
        JobsCommand::Get(job) => {
            let obj: Value = client.call("jobs.get", Some(job_params(job))).await?;
            println!("{}", serde_json::to_string_pretty(&obj)?);
        }
        JobsCommand::Delete(job) => {
            let _: Value = client.call("jobs.delete", Some(job_params(job))).await?;
            println!("deletion requested for {}/{}", job.namespace, job.name);
        }
    }
    Ok(())
}

async fn run_backup(client: &RpcClient, args: &BackupArgs) -> Result<()> {
    let _: Value = client
        .call(
            "backup.create",
            Some(json!({
                "namespace": args.namespace,
                "name": args.name,
                "volume_snapshot_content": args.volume_snapshot_content,
                "restic_secret": args.restic_secret,
                "protected_namespace": args.protected_namespace,
            })),
        )
        .await?;
    println!("backup {}/{} created", args.namespace, args.name);
    Ok(())
}

async fn run_restore(client: &RpcClient, args: &RestoreArgs) -> Result<()> {
    let _: Value = client
        .call(
            "restore.create",
            Some(json!({
                "namespace": args.namespace,
                "name": args.name,
                "restic_secret": args.restic_secret,
                "protected_namespace": args.protected_namespace,
                "backup": { "name": args.from_backup },
            })),
        )
        .await?;
    println!("restore {}/{} created", args.namespace, args.name);
    Ok(())
}

fn job_params(job: &JobArgs) -> Value {
    json!({ "kind": job.kind, "namespace": job.namespace, "name": job.name })
}
