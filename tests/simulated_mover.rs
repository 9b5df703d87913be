mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use snapmover::adapters::SimulatedDataMover;
use snapmover::core::models::{Phase, StoredObject};
use snapmover::core::registry::{
    KindDescriptor, REPLICATION_DESTINATION, REPLICATION_SOURCE, VOLUME_SNAPSHOT,
    VOLUME_SNAPSHOT_CONTENT,
};
use snapmover::core::store::ResourceStore;
use tokio_util::sync::CancellationToken;

fn trigger(kind: &str, name: &str) -> StoredObject {
    StoredObject::new(kind, Some(PROTECTED_NS), name).with_spec(json!({
        "trigger": { "manual": name },
        "restic": { "destinationPVC": "r1-pvc" },
    }))
}

/// Poll until the trigger reports a finished run.
async fn finished(store: &dyn ResourceStore, kind: &KindDescriptor, name: &str) -> StoredObject {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let obj = store.get(kind, Some(PROTECTED_NS), name).await.unwrap();
            if obj.status_str("lastSyncTime").is_some() {
                return obj;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transfer did not finish")
}

#[tokio::test]
async fn test_simulated_backup_run_succeeds() {
    let h = Harness::new(10);
    let store: Arc<dyn ResourceStore> = h.store.clone();
    let (mover, _sim) = SimulatedDataMover::new(store.clone(), Duration::ZERO);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(mover.run(shutdown.clone()));

    store
        .create(trigger(REPLICATION_SOURCE.kind, "b1-rep-src"))
        .await
        .unwrap();
    let obj = finished(store.as_ref(), &REPLICATION_SOURCE, "b1-rep-src").await;
    assert_eq!(obj.status_str("lastManualSync"), Some("b1-rep-src"));
    assert_eq!(obj.status_str("latestMoverStatus.result"), Some("Successful"));
    assert!(obj.status_str("lastSyncStartTime").is_some());

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_simulated_restore_produces_bound_snapshot() {
    let h = Harness::new(10);
    let store: Arc<dyn ResourceStore> = h.store.clone();
    let (mover, _sim) = SimulatedDataMover::new(store.clone(), Duration::ZERO);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(mover.run(shutdown.clone()));

    store
        .create(trigger(REPLICATION_DESTINATION.kind, "r1-rep-dest"))
        .await
        .unwrap();
    let obj = finished(store.as_ref(), &REPLICATION_DESTINATION, "r1-rep-dest").await;
    assert_eq!(obj.status_str("latestImage.name"), Some("r1-rep-dest-image"));

    let snapshot = store
        .get(&VOLUME_SNAPSHOT, Some(PROTECTED_NS), "r1-rep-dest-image")
        .await
        .unwrap();
    assert_eq!(
        snapshot.status_str("boundVolumeSnapshotContentName"),
        Some("r1-rep-dest-image-content")
    );
    let content = store
        .get(&VOLUME_SNAPSHOT_CONTENT, None, "r1-rep-dest-image-content")
        .await
        .unwrap();
    assert_eq!(
        content.status_str("snapshotHandle"),
        Some("sim-r1-rep-dest-image-content")
    );

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_injected_failure_fails_the_job() {
    let h = Harness::new(10);
    let store: Arc<dyn ResourceStore> = h.store.clone();
    let (mover, sim) = SimulatedDataMover::new(store.clone(), Duration::ZERO);
    sim.fail_next("b1-rep-src", "repository locked");
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(mover.run(shutdown.clone()));

    create_backup(&h, "b1").await;
    h.backups.reconcile(&key("b1")).await.unwrap();
    let obj = finished(store.as_ref(), &REPLICATION_SOURCE, "b1-rep-src").await;
    assert_eq!(obj.status_str("latestMoverStatus.result"), Some("Failed"));

    h.backups.reconcile(&key("b1")).await.unwrap();
    let job = h.backup("b1").await.unwrap();
    assert_eq!(job.status.phase, Some(Phase::PartiallyFailed));

    shutdown.cancel();
    task.await.unwrap();
}
