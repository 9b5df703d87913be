mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;
use snapmover::adapters::simulated::mark_succeeded;
use snapmover::core::batching::BatchingController;
use snapmover::core::error::StoreError;
use snapmover::core::models::{BackupJob, JobRef, Phase, StoredObject};
use snapmover::core::reconciler::Reconciler;
use snapmover::core::registry::{KindRegistry, POD, REPLICATION_SOURCE, VOLUME_SNAPSHOT_CONTENT};
use snapmover::core::status;
use snapmover::core::store::{LabelSelector, ResourceStore, WatchEvent};
use snapmover::db::{self, SqliteStore};
use tempfile::TempDir;

async fn open(dir: &TempDir) -> SqliteStore {
    let conn = db::init(&dir.path().join("snapmover.db")).await.unwrap();
    SqliteStore::new(conn, Arc::new(KindRegistry::with_defaults()))
}

#[tokio::test]
async fn test_create_get_and_duplicate() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let created = store
        .create(StoredObject::new("Pod", Some("ns"), "p").with_spec(json!({"image": "busybox"})))
        .await
        .unwrap();
    assert_eq!(created.metadata.resource_version, 1);
    assert!(created.metadata.creation_timestamp.is_some());

    let fetched = store.get(&POD, Some("ns"), "p").await.unwrap();
    assert_eq!(fetched, created);

    let err = store
        .create(StoredObject::new("Pod", Some("ns"), "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_stale_update_conflicts() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let created = store
        .create(StoredObject::new("Pod", Some("ns"), "p"))
        .await
        .unwrap();

    let mut first = created.clone();
    first.spec = json!({"a": 1});
    let updated = store.update(first).await.unwrap();
    assert_eq!(updated.metadata.resource_version, 2);

    let mut stale = created;
    stale.spec = json!({"a": 2});
    let err = store.update(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    assert_eq!(store.get(&POD, Some("ns"), "p").await.unwrap().spec["a"], 1);
}

#[tokio::test]
async fn test_status_and_spec_channels_are_separate() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let created = store
        .create(StoredObject::new("Pod", Some("ns"), "p").with_spec(json!({"a": 1})))
        .await
        .unwrap();

    let mut status_write = created.clone();
    status_write.spec = json!({"a": 99});
    status_write.status = json!({"phase": "Running"});
    let after = store.update_status(status_write).await.unwrap();
    assert_eq!(after.spec["a"], 1);
    assert_eq!(after.status["phase"], "Running");

    let mut spec_write = after.clone();
    spec_write.status = json!({});
    spec_write.spec = json!({"a": 2});
    let after = store.update(spec_write).await.unwrap();
    assert_eq!(after.spec["a"], 2);
    assert_eq!(after.status["phase"], "Running");
}

#[tokio::test]
async fn test_delete_with_finalizer_marks_until_released() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let mut obj = StoredObject::new("Pod", Some("ns"), "p");
    obj.metadata.finalizers.push("example.com/hold".into());
    store.create(obj).await.unwrap();

    store.delete(&POD, Some("ns"), "p").await.unwrap();
    let mut marked = store.get(&POD, Some("ns"), "p").await.unwrap();
    assert!(marked.metadata.is_deleting());

    marked.metadata.finalizers.clear();
    store.update(marked).await.unwrap();
    assert!(store.get(&POD, Some("ns"), "p").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_list_and_bulk_delete_by_selector() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    for (ns, name, owner) in [("a", "p1", "x"), ("a", "p2", "y"), ("b", "p3", "x")] {
        store
            .create(StoredObject::new("Pod", Some(ns), name).with_label("owner", owner))
            .await
            .unwrap();
    }
    assert_eq!(store.list(&POD, None).await.unwrap().len(), 3);
    assert_eq!(store.list(&POD, Some("a")).await.unwrap().len(), 2);

    let deleted = store
        .delete_all_of(&POD, Some("a"), &LabelSelector::matching("owner", "x"))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    let names: Vec<_> = store
        .list(&POD, None)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.metadata.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"p1".to_string()));
}

#[tokio::test]
async fn test_cluster_scoped_kinds_drop_namespace() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let created = store
        .create(StoredObject::new("VolumeSnapshotContent", Some("ignored"), "c"))
        .await
        .unwrap();
    assert_eq!(created.metadata.namespace, None);
    assert!(store.get(&VOLUME_SNAPSHOT_CONTENT, None, "c").await.is_ok());
}

#[tokio::test]
async fn test_watch_sees_writes() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let mut rx = store.watch();
    store
        .create(StoredObject::new("Pod", Some("ns"), "p"))
        .await
        .unwrap();
    store.delete(&POD, Some("ns"), "p").await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Applied(_)));
    assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Deleted(_)));
}

#[tokio::test]
async fn test_objects_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir).await;
        store
            .create(StoredObject::new("Pod", Some("ns"), "p").with_label("owner", "x"))
            .await
            .unwrap();
    }
    let store = open(&dir).await;
    let obj = store.get(&POD, Some("ns"), "p").await.unwrap();
    assert_eq!(obj.label("owner"), Some("x"));
}

#[tokio::test]
async fn test_backup_lifecycle_on_sqlite() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ResourceStore> = Arc::new(open(&dir).await);
    let backups: Reconciler<BackupJob> =
        Reconciler::new(store.clone(), BatchingController::new(2), settings());

    seed_source(store.as_ref(), "b1-source").await;
    seed_secret(store.as_ref()).await;
    create(store.as_ref(), &backup_job("b1", "b1-source")).await;

    let key = JobRef::new(APP_NS, "b1");
    backups.reconcile(&key).await.unwrap();
    mark_succeeded(store.as_ref(), &REPLICATION_SOURCE, Some(PROTECTED_NS), "b1-rep-src")
        .await
        .unwrap();
    let action = backups.reconcile(&key).await.unwrap();
    assert_eq!(action.last_step, Some("settled"));

    let job = status::load::<BackupJob>(store.as_ref(), &key).await.unwrap().unwrap();
    assert_eq!(job.status.phase, Some(Phase::Completed));
    assert!(store.list(&POD, Some(PROTECTED_NS)).await.unwrap().is_empty());
}
