#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use snapmover::adapters::MemoryStore;
use snapmover::core::batching::BatchingController;
use snapmover::core::job::MoverJob;
use snapmover::core::models::{
    BackupJob, BackupJobSpec, JobRef, JobStatus, LocalObjectReference, ObjectMeta, RestoreJob,
    RestoreJobSpec, StoredObject, VsbRef,
};
use snapmover::core::reconciler::{Reconciler, ReconcilerSettings};
use snapmover::core::registry::{KindDescriptor, KindRegistry, SECRET, VOLUME_SNAPSHOT_CONTENT};
use snapmover::core::status;
use snapmover::core::store::{ResourceStore, get_opt};

pub const APP_NS: &str = "apps";
pub const PROTECTED_NS: &str = "adp";
pub const SECRET_NAME: &str = "restic-creds";
pub const REPOSITORY: &str = "s3:s3.example.com/bucket/base";

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub backups: Reconciler<BackupJob>,
    pub restores: Reconciler<RestoreJob>,
}

pub fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        poll_interval: Duration::from_millis(50),
        ..ReconcilerSettings::default()
    }
}

impl Harness {
    pub fn new(limit: usize) -> Self {
        Self::with_settings(limit, settings())
    }

    pub fn with_settings(limit: usize, settings: ReconcilerSettings) -> Self {
        let registry = Arc::new(KindRegistry::with_defaults());
        let store = Arc::new(MemoryStore::new(registry));
        let dyn_store: Arc<dyn ResourceStore> = store.clone();
        Self {
            backups: Reconciler::new(
                dyn_store.clone(),
                BatchingController::new(limit),
                settings.clone(),
            ),
            restores: Reconciler::new(dyn_store, BatchingController::new(limit), settings),
            store,
        }
    }

    pub fn dyn_store(&self) -> &dyn ResourceStore {
        self.store.as_ref()
    }

    pub async fn backup(&self, name: &str) -> Option<BackupJob> {
        status::load::<BackupJob>(self.dyn_store(), &JobRef::new(APP_NS, name))
            .await
            .unwrap()
    }

    pub async fn restore(&self, name: &str) -> Option<RestoreJob> {
        status::load::<RestoreJob>(self.dyn_store(), &JobRef::new(APP_NS, name))
            .await
            .unwrap()
    }

    pub async fn staged(&self, kind: &KindDescriptor, name: &str) -> Option<StoredObject> {
        get_opt(self.dyn_store(), kind, kind.scope(Some(PROTECTED_NS)), name)
            .await
            .unwrap()
    }
}

pub fn key(name: &str) -> JobRef {
    JobRef::new(APP_NS, name)
}

/// A ready source snapshot content.
pub async fn seed_source(store: &dyn ResourceStore, name: &str) {
    let content = StoredObject::new(VOLUME_SNAPSHOT_CONTENT.kind, None, name)
        .with_spec(json!({
            "driver": "ebs.csi.aws.com",
            "volumeSnapshotClassName": "csi-snapclass",
        }))
        .with_status(json!({
            "snapshotHandle": format!("handle-{name}"),
            "restoreSize": "10Gi",
            "readyToUse": true,
        }));
    store.create(content).await.unwrap();
}

/// The credential secret jobs reference in the protected namespace.
pub async fn seed_secret(store: &dyn ResourceStore) {
    let secret = StoredObject::new(SECRET.kind, Some(PROTECTED_NS), SECRET_NAME).with_spec(json!({
        "data": {
            "RESTIC_REPOSITORY": REPOSITORY,
            "RESTIC_PASSWORD": "hunter2",
        }
    }));
    store.create(secret).await.unwrap();
}

pub fn backup_job(name: &str, content: &str) -> BackupJob {
    BackupJob {
        metadata: ObjectMeta::new(Some(APP_NS), name),
        spec: BackupJobSpec {
            volume_snapshot_content: LocalObjectReference {
                name: content.to_string(),
            },
            restic_secret_ref: LocalObjectReference {
                name: SECRET_NAME.to_string(),
            },
            protected_namespace: PROTECTED_NS.to_string(),
        },
        status: JobStatus::default(),
    }
}

pub fn restore_job(name: &str, backup_ref: VsbRef) -> RestoreJob {
    RestoreJob {
        metadata: ObjectMeta::new(Some(APP_NS), name),
        spec: RestoreJobSpec {
            restic_secret_ref: LocalObjectReference {
                name: SECRET_NAME.to_string(),
            },
            backup_ref,
            protected_namespace: PROTECTED_NS.to_string(),
        },
        status: JobStatus::default(),
    }
}

pub async fn create<J: MoverJob>(store: &dyn ResourceStore, job: &J) {
    store.create(job.to_object().unwrap()).await.unwrap();
}

/// Seed a source content and secret, then create a backup job over it.
pub async fn create_backup(harness: &Harness, name: &str) {
    let content = format!("{name}-source");
    seed_source(harness.dyn_store(), &content).await;
    if get_opt(harness.dyn_store(), &SECRET, Some(PROTECTED_NS), SECRET_NAME)
        .await
        .unwrap()
        .is_none()
    {
        seed_secret(harness.dyn_store()).await;
    }
    create(harness.dyn_store(), &backup_job(name, &content)).await;
}
