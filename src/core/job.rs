//! The two job kinds behind one trait.
//!
//! Backup and restore are structurally parallel; everything that differs
//! between them (kinds, labels, staging, post-transfer bookkeeping) is reached
//! through [`MoverJob`], so the reconciler and cleanup code are written once.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::bridge::TransferObservation;
use super::error::{ReconcileError, StoreError};
use super::models::{BackupJob, JobRef, JobStatus, ObjectMeta, Phase, RestoreJob, StoredObject};
use super::registry::{
    BACKUP_JOB, BACKUP_STAGED_KINDS, KindDescriptor, REPLICATION_DESTINATION, REPLICATION_SOURCE,
    RESTORE_JOB, RESTORE_STAGED_KINDS, StagedKind,
};
use super::staging::{self, StageOutcome, StagedNames, TransferResults};
use super::store::{LabelSelector, ResourceStore};

/// Finalizer that keeps a job around until its staged resources are reclaimed.
pub const STAGED_RESOURCES_FINALIZER: &str = "datamover.oadp.openshift.io/staged-resources";

/// Ownership label put on everything staged for a backup; value is the job name.
pub const BACKUP_OWNER_LABEL: &str = "datamover.oadp.openshift.io/vsb";

/// Ownership label put on everything staged for a restore; value is the job name.
pub const RESTORE_OWNER_LABEL: &str = "datamover.oadp.openshift.io/vsr";

/// Namespace of the owning job. Job names are only unique per namespace, so
/// ownership is the pair of this label and the kind's owner label.
pub const OWNER_NAMESPACE_LABEL: &str = "datamover.oadp.openshift.io/owner-namespace";

#[async_trait]
pub trait MoverJob: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: KindDescriptor;
    const OWNER_LABEL: &'static str;
    /// Phase marking that the external transfer finished.
    const TRANSFER_DONE: Phase;
    /// Kind of the resource that triggers the external transfer.
    const TRANSFER_KIND: KindDescriptor;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    fn status(&self) -> &JobStatus;
    fn status_mut(&mut self) -> &mut JobStatus;
    fn protected_namespace(&self) -> &str;
    fn staged_kinds() -> &'static [StagedKind];
    fn staged_names(&self) -> StagedNames;

    /// Reject specs that can never be staged.
    fn validate(&self) -> Result<(), ReconcileError>;

    /// Create every staged resource and the transfer trigger (last), skipping
    /// whatever already exists.
    async fn stage(&self, store: &dyn ResourceStore) -> Result<StageOutcome, ReconcileError>;

    /// Collect what the finished transfer produced. `None` means not yet
    /// available.
    async fn transfer_results(
        &self,
        store: &dyn ResourceStore,
        observed: &TransferObservation,
    ) -> Result<Option<TransferResults>, ReconcileError>;

    fn job_ref(&self) -> JobRef {
        JobRef::from_meta(self.metadata())
    }

    fn owner_selector(&self) -> LabelSelector {
        let meta = self.metadata();
        LabelSelector::matching(Self::OWNER_LABEL, &meta.name)
            .and(OWNER_NAMESPACE_LABEL, meta.namespace.as_deref().unwrap_or_default())
    }

    /// Whether `obj` was staged for this job.
    fn owns(&self, obj: &StoredObject) -> bool {
        self.owner_selector().matches(&obj.metadata.labels)
    }

    fn from_object(obj: StoredObject) -> Result<Self, ReconcileError> {
        if obj.kind != Self::KIND.kind {
            return Err(StoreError::Invalid(format!(
                "expected {}, got {}",
                Self::KIND.kind,
                obj.kind
            ))
            .into());
        }
        let value =
            serde_json::to_value(obj).map_err(|e| ReconcileError::decode(Self::KIND.kind, e))?;
        serde_json::from_value(value).map_err(|e| ReconcileError::decode(Self::KIND.kind, e))
    }

    fn to_object(&self) -> Result<StoredObject, ReconcileError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| ReconcileError::decode(Self::KIND.kind, e))?;
        if let Some(map) = value.as_object_mut() {
            map.insert("kind".to_string(), Value::String(Self::KIND.kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ReconcileError::decode(Self::KIND.kind, e))
    }
}

fn require(field: &str, value: &str) -> Result<(), ReconcileError> {
    if value.trim().is_empty() {
        return Err(ReconcileError::Validation(format!("{field} must be set")));
    }
    Ok(())
}

#[async_trait]
impl MoverJob for BackupJob {
    const KIND: KindDescriptor = BACKUP_JOB;
    const OWNER_LABEL: &'static str = BACKUP_OWNER_LABEL;
    const TRANSFER_DONE: Phase = Phase::SnapshotBackupDone;
    const TRANSFER_KIND: KindDescriptor = REPLICATION_SOURCE;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &JobStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut JobStatus {
        &mut self.status
    }

    fn protected_namespace(&self) -> &str {
        &self.spec.protected_namespace
    }

    fn staged_kinds() -> &'static [StagedKind] {
        BACKUP_STAGED_KINDS
    }

    fn staged_names(&self) -> StagedNames {
        StagedNames::for_backup(&self.metadata.name)
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        require("spec.protectedNamespace", &self.spec.protected_namespace)?;
        require("spec.resticSecretRef.name", &self.spec.restic_secret_ref.name)?;
        require(
            "spec.volumeSnapshotContent.name",
            &self.spec.volume_snapshot_content.name,
        )
    }

    async fn stage(&self, store: &dyn ResourceStore) -> Result<StageOutcome, ReconcileError> {
        staging::stage_backup(store, self).await
    }

    async fn transfer_results(
        &self,
        _store: &dyn ResourceStore,
        _observed: &TransferObservation,
    ) -> Result<Option<TransferResults>, ReconcileError> {
        // Handle and content were recorded while staging.
        Ok(Some(TransferResults::default()))
    }
}

#[async_trait]
impl MoverJob for RestoreJob {
    const KIND: KindDescriptor = RESTORE_JOB;
    const OWNER_LABEL: &'static str = RESTORE_OWNER_LABEL;
    const TRANSFER_DONE: Phase = Phase::SnapshotRestoreDone;
    const TRANSFER_KIND: KindDescriptor = REPLICATION_DESTINATION;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &JobStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut JobStatus {
        &mut self.status
    }

    fn protected_namespace(&self) -> &str {
        &self.spec.protected_namespace
    }

    fn staged_kinds() -> &'static [StagedKind] {
        RESTORE_STAGED_KINDS
    }

    fn staged_names(&self) -> StagedNames {
        StagedNames::for_restore(&self.metadata.name)
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        let backup = &self.spec.backup_ref;
        require("spec.protectedNamespace", &self.spec.protected_namespace)?;
        require("spec.resticSecretRef.name", &self.spec.restic_secret_ref.name)?;
        require(
            "spec.volumeSnapshotMoverBackupRef.sourcePVCData.name",
            &backup.source_pvc_data.name,
        )?;
        require(
            "spec.volumeSnapshotMoverBackupRef.sourcePVCData.size",
            &backup.source_pvc_data.size,
        )?;
        require(
            "spec.volumeSnapshotMoverBackupRef.resticrepository",
            &backup.restic_repository,
        )
    }

    async fn stage(&self, store: &dyn ResourceStore) -> Result<StageOutcome, ReconcileError> {
        staging::stage_restore(store, self).await
    }

    async fn transfer_results(
        &self,
        store: &dyn ResourceStore,
        observed: &TransferObservation,
    ) -> Result<Option<TransferResults>, ReconcileError> {
        staging::resolve_restored_snapshot(store, self, observed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{BackupJobSpec, LocalObjectReference};

    fn backup(name: &str) -> BackupJob {
        BackupJob {
            metadata: ObjectMeta::new(Some("apps"), name),
            spec: BackupJobSpec {
                volume_snapshot_content: LocalObjectReference { name: "snapcontent-1".into() },
                restic_secret_ref: LocalObjectReference { name: "creds".into() },
                protected_namespace: "adp".into(),
            },
            status: JobStatus::default(),
        }
    }

    #[test]
    fn test_object_conversion_keeps_kind_and_fields() {
        let job = backup("b1");
        let obj = job.to_object().unwrap();
        assert_eq!(obj.kind, "VolumeSnapshotBackup");
        assert_eq!(obj.spec["volumeSnapshotContent"]["name"], "snapcontent-1");
        assert_eq!(BackupJob::from_object(obj).unwrap(), job);
    }

    #[test]
    fn test_wrong_kind_is_rejected() {
        let obj = backup("b1").to_object().unwrap();
        assert!(RestoreJob::from_object(obj).is_err());
    }

    #[test]
    fn test_validation_names_missing_field() {
        let mut job = backup("b1");
        job.spec.protected_namespace.clear();
        let err = job.validate().unwrap_err();
        assert!(err.to_string().contains("protectedNamespace"));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_ownership_needs_name_and_namespace() {
        let job = backup("b1");
        let owned = StoredObject::new("Pod", Some("adp"), "b1-pod")
            .with_label(BACKUP_OWNER_LABEL, "b1")
            .with_label(OWNER_NAMESPACE_LABEL, "apps");
        assert!(job.owns(&owned));

        let namesake = StoredObject::new("Pod", Some("adp"), "b1-pod")
            .with_label(BACKUP_OWNER_LABEL, "b1")
            .with_label(OWNER_NAMESPACE_LABEL, "team2");
        assert!(!job.owns(&namesake));

        let unlabelled = StoredObject::new("Pod", Some("adp"), "b1-pod").with_label(BACKUP_OWNER_LABEL, "b1");
        assert!(!job.owns(&unlabelled));
    }
}
