mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::{Value, json};
use snapmover::adapters::MemoryStore;
use snapmover::config::AppConfig;
use snapmover::context::AppContext;
use snapmover::core::job::MoverJob;
use snapmover::core::models::{BackupJob, Phase, RestoreJob, StoredObject};
use snapmover::core::{KindRegistry, Orchestrator};
use snapmover::rpc::methods::{DaemonStatus, JobKind, JobSummary};
use snapmover::rpc::{ClientError, RpcClient};
use tokio_util::sync::CancellationToken;

fn config() -> AppConfig {
    AppConfig {
        rpc_bind: "127.0.0.1:0".into(),
        simulation: true,
        simulated_transfer_secs: 0,
        poll_interval_secs: 1,
        resync_interval_secs: 5,
        max_concurrent_backups: 1,
        ..AppConfig::default()
    }
}

async fn wait_until_settled<J: MoverJob>(client: &RpcClient, kind: JobKind, name: &str) -> J {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let obj: StoredObject = client
                .call(
                    "jobs.get",
                    Some(json!({ "kind": kind, "namespace": APP_NS, "name": name })),
                )
                .await
                .unwrap();
            let job = J::from_object(obj).unwrap();
            if job.status().phase.is_some_and(Phase::is_outcome) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("job did not settle")
}

#[tokio::test]
async fn test_backup_and_restore_through_rpc() {
    let config = config();
    let registry = Arc::new(KindRegistry::with_defaults());
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let ctx = AppContext::new(config, registry, store);

    let shutdown = CancellationToken::new();
    let running = Orchestrator::new(ctx).spawn(shutdown.clone()).await.unwrap();
    let client = RpcClient::new(running.rpc_addr);

    let source = StoredObject::new("VolumeSnapshotContent", None, "b1-source")
        .with_spec(json!({ "volumeSnapshotClassName": "csi-snapclass" }))
        .with_status(json!({ "snapshotHandle": "handle-b1", "restoreSize": "5Gi" }));
    let secret = StoredObject::new("Secret", Some(PROTECTED_NS), SECRET_NAME)
        .with_spec(json!({ "data": { "RESTIC_REPOSITORY": REPOSITORY } }));
    for object in [source, secret] {
        let _: Value = client
            .call("objects.create", Some(json!({ "object": object })))
            .await
            .unwrap();
    }

    let _: Value = client
        .call(
            "backup.create",
            Some(json!({
                "namespace": APP_NS,
                "name": "b1",
                "volume_snapshot_content": "b1-source",
                "restic_secret": SECRET_NAME,
                "protected_namespace": PROTECTED_NS,
            })),
        )
        .await
        .unwrap();

    let backup: BackupJob = wait_until_settled(&client, JobKind::Backup, "b1").await;
    assert_eq!(backup.status.phase, Some(Phase::Completed));
    assert_eq!(
        backup.status.restic_repository.as_deref(),
        Some("s3:s3.example.com/bucket/base/b1")
    );

    let _: Value = client
        .call(
            "restore.create",
            Some(json!({
                "namespace": APP_NS,
                "name": "r1",
                "restic_secret": SECRET_NAME,
                "protected_namespace": PROTECTED_NS,
                "backup": { "name": "b1" },
            })),
        )
        .await
        .unwrap();

    let restore: RestoreJob = wait_until_settled(&client, JobKind::Restore, "r1").await;
    assert_eq!(restore.status.phase, Some(Phase::Completed));
    assert_eq!(restore.spec.backup_ref.source_pvc_data.size, "5Gi");
    assert!(restore.status.snapshot_handle.is_some());

    let rows: Vec<JobSummary> = client.call("jobs.list", None).await.unwrap();
    assert_eq!(rows.len(), 2);

    let status: DaemonStatus = client.call_no_params("daemon.status").await.unwrap();
    assert!(status.simulation);
    assert!(status.backups.processing.is_empty());
    assert!(status.restores.queued.is_empty());

    shutdown.cancel();
    running.wait().await.unwrap();
}

#[tokio::test]
async fn test_restore_from_unknown_backup_is_rejected() {
    let registry = Arc::new(KindRegistry::with_defaults());
    let store = Arc::new(MemoryStore::new(registry.clone()));
    let ctx = AppContext::new(config(), registry, store);

    let shutdown = CancellationToken::new();
    let running = Orchestrator::new(ctx).spawn(shutdown.clone()).await.unwrap();
    let client = RpcClient::new(running.rpc_addr);

    let err = client
        .call::<Value>(
            "restore.create",
            Some(json!({
                "namespace": APP_NS,
                "name": "r1",
                "restic_secret": SECRET_NAME,
                "protected_namespace": PROTECTED_NS,
                "backup": { "name": "missing" },
            })),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rpc(_)));

    shutdown.cancel();
    running.wait().await.unwrap();
}
