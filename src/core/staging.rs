//! Staged resource naming and creation.
//!
//! Every staged object is created through [`create_if_absent`], labelled with
//! the owning job, and named by [`StagedNames`]. The same names are used by the
//! cleanup verification pass, so creation and verification cannot drift apart.

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::bridge::TransferObservation;
use super::error::ReconcileError;
use super::job::MoverJob;
use super::models::{BackupJob, JobStatus, ObjectKey, PvcData, RestoreJob, StoredObject};
use super::registry::{
    KindDescriptor, PERSISTENT_VOLUME_CLAIM, POD, REPLICATION_DESTINATION, REPLICATION_SOURCE,
    SECRET, StagedRole, VOLUME_SNAPSHOT, VOLUME_SNAPSHOT_CONTENT,
};
use super::store::{Ensured, ResourceStore, create_if_absent, get_opt};

/// Image of the pod that keeps the cloned claim bound.
pub const BINDER_IMAGE: &str = "registry.access.redhat.com/ubi9/ubi-minimal:latest";

/// Credential key holding the base repository path.
pub const REPOSITORY_KEY: &str = "RESTIC_REPOSITORY";

/// Deterministic names of a job's staged resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedNames {
    pub claim: Option<String>,
    pub pod: Option<String>,
    pub snapshot: Option<String>,
    pub snapshot_content: Option<String>,
    pub secret: Option<String>,
    pub transfer: String,
}

impl StagedNames {
    pub fn for_backup(job: &str) -> Self {
        Self {
            claim: Some(format!("{job}-pvc")),
            pod: Some(format!("{job}-pod")),
            snapshot: Some(format!("{job}-snapshot")),
            snapshot_content: Some(format!("{job}-clone")),
            secret: Some(format!("{job}-secret")),
            transfer: format!("{job}-rep-src"),
        }
    }

    pub fn for_restore(job: &str) -> Self {
        Self {
            claim: Some(format!("{job}-pvc")),
            secret: Some(format!("{job}-secret")),
            transfer: format!("{job}-rep-dest"),
            ..Default::default()
        }
    }

    pub fn name(&self, role: StagedRole) -> Option<&str> {
        match role {
            StagedRole::ClonedClaim => self.claim.as_deref(),
            StagedRole::MountPod => self.pod.as_deref(),
            StagedRole::ClonedSnapshot => self.snapshot.as_deref(),
            StagedRole::ClonedSnapshotContent => self.snapshot_content.as_deref(),
            StagedRole::Credential => self.secret.as_deref(),
            StagedRole::TransferTrigger => Some(&self.transfer),
        }
    }

    fn require(&self, role: StagedRole) -> Result<&str, ReconcileError> {
        self.name(role).ok_or_else(|| {
            ReconcileError::Validation(format!("no staged resource plays {role:?} for this job"))
        })
    }
}

/// Result of a staging attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Staged(StagedStatus),
    /// An input is not ready yet; try again later.
    Waiting(String),
}

/// Status fields learned while staging, plus what was actually created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagedStatus {
    pub snapshot_handle: Option<String>,
    pub volume_snapshot_content_name: Option<String>,
    pub source_pvc_data: Option<PvcData>,
    pub restic_repository: Option<String>,
    pub volume_snapshot_class_name: Option<String>,
    pub transfer_name: String,
    pub created: Vec<ObjectKey>,
}

impl StagedStatus {
    /// Copy the learned fields into `status`. Returns whether anything changed.
    pub fn apply(&self, status: &mut JobStatus, track_transfer: bool) -> bool {
        let mut changed = false;
        changed |= set_if_some(&mut status.snapshot_handle, &self.snapshot_handle);
        changed |= set_if_some(
            &mut status.volume_snapshot_content_name,
            &self.volume_snapshot_content_name,
        );
        changed |= set_if_some(&mut status.source_pvc_data, &self.source_pvc_data);
        changed |= set_if_some(&mut status.restic_repository, &self.restic_repository);
        changed |= set_if_some(
            &mut status.volume_snapshot_class_name,
            &self.volume_snapshot_class_name,
        );
        if track_transfer {
            let data = status.replication_destination_data.get_or_insert_with(Default::default);
            if data.name != self.transfer_name {
                data.name = self.transfer_name.clone();
                changed = true;
            }
        }
        changed
    }
}

/// What a finished transfer produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferResults {
    pub snapshot_handle: Option<String>,
    pub volume_snapshot_content_name: Option<String>,
}

impl TransferResults {
    pub fn apply(&self, status: &mut JobStatus) -> bool {
        set_if_some(&mut status.snapshot_handle, &self.snapshot_handle)
            | set_if_some(
                &mut status.volume_snapshot_content_name,
                &self.volume_snapshot_content_name,
            )
    }
}

fn set_if_some<T: Clone + PartialEq>(slot: &mut Option<T>, value: &Option<T>) -> bool {
    match value {
        Some(v) if slot.as_ref() != Some(v) => {
            *slot = Some(v.clone());
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn staged_object<J: MoverJob>(job: &J, kind: &KindDescriptor, name: &str, spec: Value) -> StoredObject {
    job.owner_selector().labels().fold(
        StoredObject::new(kind.kind, kind.scope(Some(job.protected_namespace())), name),
        |obj, (key, value)| obj.with_label(key, value),
    )
    .with_spec(spec)
}

/// Create a staged object unless it exists. An existing object owned by a
/// different job is never adopted.
async fn ensure_staged<J: MoverJob>(
    store: &dyn ResourceStore,
    job: &J,
    kind: &KindDescriptor,
    obj: StoredObject,
    created: &mut Vec<ObjectKey>,
) -> Result<(), ReconcileError> {
    let ensured = create_if_absent(store, kind, obj).await?;
    match &ensured {
        Ensured::Created(obj) => {
            debug!(job = %job.job_ref(), object = %obj.key(), "Created staged resource");
            created.push(obj.key());
        }
        Ensured::Existing(obj) => {
            if !job.owns(obj) {
                return Err(ReconcileError::Ownership {
                    kind: obj.kind.clone(),
                    name: obj.metadata.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Read the data of the credential secret a job references.
async fn credential_data(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> Result<Map<String, Value>, ReconcileError> {
    let secret = get_opt(store, &SECRET, Some(namespace), name)
        .await?
        .ok_or_else(|| {
            ReconcileError::Validation(format!(
                "credential secret {namespace}/{name} does not exist"
            ))
        })?;
    Ok(secret
        .spec
        .get("data")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default())
}

/// Quantities may be stored as strings ("10Gi") or plain byte counts.
fn quantity(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Backup
// ---------------------------------------------------------------------------

pub async fn stage_backup(
    store: &dyn ResourceStore,
    job: &BackupJob,
) -> Result<StageOutcome, ReconcileError> {
    let names = job.staged_names();
    let namespace = job.spec.protected_namespace.as_str();
    let owner = job.metadata.name.as_str();
    let source_name = job.spec.volume_snapshot_content.name.as_str();

    let source = get_opt(store, &VOLUME_SNAPSHOT_CONTENT, None, source_name)
        .await?
        .ok_or_else(|| {
            ReconcileError::Validation(format!(
                "source VolumeSnapshotContent {source_name:?} does not exist"
            ))
        })?;
    let Some(handle) = source.status_str("snapshotHandle").map(str::to_string) else {
        return Ok(StageOutcome::Waiting(format!(
            "VolumeSnapshotContent {source_name:?} has no snapshot handle yet"
        )));
    };
    let Some(size) = quantity(source.status.get("restoreSize")) else {
        return Ok(StageOutcome::Waiting(format!(
            "VolumeSnapshotContent {source_name:?} has no restore size yet"
        )));
    };
    let class = source.spec_str("volumeSnapshotClassName").unwrap_or_default().to_string();
    let driver = source.spec_str("driver").unwrap_or_default().to_string();

    let mut credentials =
        credential_data(store, namespace, &job.spec.restic_secret_ref.name).await?;
    let base = credentials
        .get(REPOSITORY_KEY)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ReconcileError::Validation(format!("credential secret has no {REPOSITORY_KEY}"))
        })?;
    let repository = format!("{}/{}", base.trim_end_matches('/'), owner);
    credentials.insert(REPOSITORY_KEY.to_string(), Value::String(repository.clone()));

    let content = names.require(StagedRole::ClonedSnapshotContent)?;
    let snapshot = names.require(StagedRole::ClonedSnapshot)?;
    let claim = names.require(StagedRole::ClonedClaim)?;
    let pod = names.require(StagedRole::MountPod)?;
    let secret = names.require(StagedRole::Credential)?;

    let mut created = Vec::new();

    let content_spec = json!({
        "deletionPolicy": "Delete",
        "driver": driver,
        "source": { "snapshotHandle": handle },
        "volumeSnapshotClassName": class,
        "volumeSnapshotRef": { "name": snapshot, "namespace": namespace },
    });
    let obj = staged_object(job, &VOLUME_SNAPSHOT_CONTENT, content, content_spec);
    ensure_staged(store, job, &VOLUME_SNAPSHOT_CONTENT, obj, &mut created).await?;

    let snapshot_spec = json!({
        "volumeSnapshotClassName": class,
        "source": { "volumeSnapshotContentName": content },
    });
    let obj = staged_object(job, &VOLUME_SNAPSHOT, snapshot, snapshot_spec);
    ensure_staged(store, job, &VOLUME_SNAPSHOT, obj, &mut created).await?;

    let claim_spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "dataSource": {
            "apiGroup": "snapshot.storage.k8s.io",
            "kind": "VolumeSnapshot",
            "name": snapshot,
        },
        "resources": { "requests": { "storage": size } },
    });
    let obj = staged_object(job, &PERSISTENT_VOLUME_CLAIM, claim, claim_spec);
    ensure_staged(store, job, &PERSISTENT_VOLUME_CLAIM, obj, &mut created).await?;

    let pod_spec = json!({
        "containers": [{
            "name": "binder",
            "image": BINDER_IMAGE,
            "command": ["sleep", "infinity"],
            "volumeMounts": [{ "name": "data", "mountPath": "/data" }],
        }],
        "volumes": [{ "name": "data", "persistentVolumeClaim": { "claimName": claim } }],
    });
    let obj = staged_object(job, &POD, pod, pod_spec);
    ensure_staged(store, job, &POD, obj, &mut created).await?;

    let obj = staged_object(job, &SECRET, secret, json!({ "data": credentials }));
    ensure_staged(store, job, &SECRET, obj, &mut created).await?;

    // The trigger goes last: its existence means staging finished.
    let trigger_spec = json!({
        "sourcePVC": claim,
        "trigger": { "manual": owner },
        "restic": { "repository": secret, "copyMethod": "Direct" },
    });
    let obj = staged_object(job, &REPLICATION_SOURCE, &names.transfer, trigger_spec);
    ensure_staged(store, job, &REPLICATION_SOURCE, obj, &mut created).await?;

    info!(job = %job.job_ref(), created = created.len(), "Backup resources staged");

    Ok(StageOutcome::Staged(StagedStatus {
        snapshot_handle: Some(handle),
        volume_snapshot_content_name: Some(content.to_string()),
        source_pvc_data: Some(PvcData {
            name: claim.to_string(),
            size,
        }),
        restic_repository: Some(repository),
        volume_snapshot_class_name: (!class.is_empty()).then_some(class),
        transfer_name: names.transfer.clone(),
        created,
    }))
}

// ---------------------------------------------------------------------------
// Restore
// ---------------------------------------------------------------------------

pub async fn stage_restore(
    store: &dyn ResourceStore,
    job: &RestoreJob,
) -> Result<StageOutcome, ReconcileError> {
    let names = job.staged_names();
    let namespace = job.spec.protected_namespace.as_str();
    let owner = job.metadata.name.as_str();
    let backup = &job.spec.backup_ref;

    let mut credentials =
        credential_data(store, namespace, &job.spec.restic_secret_ref.name).await?;
    credentials.insert(
        REPOSITORY_KEY.to_string(),
        Value::String(backup.restic_repository.clone()),
    );

    let claim = names.require(StagedRole::ClonedClaim)?;
    let secret = names.require(StagedRole::Credential)?;
    let size = backup.source_pvc_data.size.as_str();

    let mut created = Vec::new();

    let obj = staged_object(job, &SECRET, secret, json!({ "data": credentials }));
    ensure_staged(store, job, &SECRET, obj, &mut created).await?;

    let claim_spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": size } },
    });
    let obj = staged_object(job, &PERSISTENT_VOLUME_CLAIM, claim, claim_spec);
    ensure_staged(store, job, &PERSISTENT_VOLUME_CLAIM, obj, &mut created).await?;

    let trigger_spec = json!({
        "trigger": { "manual": owner },
        "restic": {
            "repository": secret,
            "destinationPVC": claim,
            "copyMethod": "Snapshot",
            "volumeSnapshotClassName": backup.volume_snapshot_class_name,
            "capacity": size,
            "accessModes": ["ReadWriteOnce"],
        },
    });
    let obj = staged_object(job, &REPLICATION_DESTINATION, &names.transfer, trigger_spec);
    ensure_staged(store, job, &REPLICATION_DESTINATION, obj, &mut created).await?;

    info!(job = %job.job_ref(), created = created.len(), "Restore resources staged");

    Ok(StageOutcome::Staged(StagedStatus {
        transfer_name: names.transfer.clone(),
        created,
        ..Default::default()
    }))
}

/// Follow the restore's latest image to its bound snapshot content.
pub async fn resolve_restored_snapshot(
    store: &dyn ResourceStore,
    job: &RestoreJob,
    observed: &TransferObservation,
) -> Result<Option<TransferResults>, ReconcileError> {
    let Some(image) = observed.latest_image.as_deref() else {
        return Ok(None);
    };
    let namespace = job.protected_namespace();
    let Some(snapshot) = get_opt(store, &VOLUME_SNAPSHOT, Some(namespace), image).await? else {
        return Ok(None);
    };
    let Some(content_name) = snapshot.status_str("boundVolumeSnapshotContentName") else {
        return Ok(None);
    };
    let handle = get_opt(store, &VOLUME_SNAPSHOT_CONTENT, None, content_name)
        .await?
        .and_then(|content| content.status_str("snapshotHandle").map(str::to_string));
    if handle.is_none() {
        return Ok(None);
    }
    Ok(Some(TransferResults {
        snapshot_handle: handle,
        volume_snapshot_content_name: Some(content_name.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_names_cover_every_role() {
        let names = StagedNames::for_backup("b1");
        assert_eq!(names.name(StagedRole::ClonedClaim), Some("b1-pvc"));
        assert_eq!(names.name(StagedRole::MountPod), Some("b1-pod"));
        assert_eq!(names.name(StagedRole::ClonedSnapshot), Some("b1-snapshot"));
        assert_eq!(names.name(StagedRole::ClonedSnapshotContent), Some("b1-clone"));
        assert_eq!(names.name(StagedRole::Credential), Some("b1-secret"));
        assert_eq!(names.name(StagedRole::TransferTrigger), Some("b1-rep-src"));
    }

    #[test]
    fn test_restore_names_skip_backup_only_roles() {
        let names = StagedNames::for_restore("r1");
        assert_eq!(names.name(StagedRole::MountPod), None);
        assert_eq!(names.name(StagedRole::TransferTrigger), Some("r1-rep-dest"));
    }

    #[test]
    fn test_staged_status_apply_is_idempotent() {
        let staged = StagedStatus {
            snapshot_handle: Some("h".into()),
            transfer_name: "r1-rep-dest".into(),
            ..Default::default()
        };
        let mut status = JobStatus::default();
        assert!(staged.apply(&mut status, true));
        assert!(!staged.apply(&mut status, true));
        assert_eq!(
            status.replication_destination_data.unwrap().name,
            "r1-rep-dest"
        );
    }

    #[test]
    fn test_quantity_accepts_strings_and_numbers() {
        assert_eq!(quantity(Some(&json!("10Gi"))), Some("10Gi".into()));
        assert_eq!(quantity(Some(&json!(1073741824))), Some("1073741824".into()));
        assert_eq!(quantity(Some(&json!(""))), None);
        assert_eq!(quantity(None), None);
    }
}
