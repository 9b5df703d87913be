use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Labels = BTreeMap<String, String>;

/// Metadata carried by every stored object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub uid: String,
    /// Optimistic-concurrency token. Zero means "never persisted".
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// An untyped object as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl StoredObject {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            metadata: ObjectMeta::new(namespace, name),
            spec: Value::Null,
            status: Value::Null,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.status = status;
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind.clone(),
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    /// The object's identity read as a job reference.
    pub fn job_ref(&self) -> JobRef {
        JobRef::from_meta(&self.metadata)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    /// Look up a string at a dotted path below `status`.
    pub fn status_str(&self, path: &str) -> Option<&str> {
        lookup(&self.status, path).and_then(Value::as_str)
    }

    /// Look up a string at a dotted path below `spec`.
    pub fn spec_str(&self, path: &str) -> Option<&str> {
        lookup(&self.spec, path).and_then(Value::as_str)
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |v, segment| v.get(segment))
}

/// Identity of a stored object. Cluster-scoped objects have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Identity of a job within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobRef {
    pub namespace: String,
    pub name: String,
}

impl JobRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone(),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Job phase. Advances along a fixed rank order and never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    InProgress,
    /// The external transfer of a backup finished; staged resources remain.
    SnapshotBackupDone,
    /// The external transfer of a restore finished; staged resources remain.
    SnapshotRestoreDone,
    Completed,
    Failed,
    PartiallyFailed,
    /// The job is being deleted and its staged resources reclaimed.
    Cleanup,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::InProgress => 1,
            Phase::SnapshotBackupDone | Phase::SnapshotRestoreDone => 2,
            Phase::Completed | Phase::Failed | Phase::PartiallyFailed => 3,
            Phase::Cleanup => 4,
        }
    }

    /// Whether a job in `current` may move to `next`. Staying put is allowed.
    pub fn can_advance(current: Option<Phase>, next: Phase) -> bool {
        match current {
            None => true,
            Some(c) => c == next || next.rank() > c.rank(),
        }
    }

    pub fn is_transfer_done(self) -> bool {
        matches!(self, Phase::SnapshotBackupDone | Phase::SnapshotRestoreDone)
    }

    /// Completed, Failed or PartiallyFailed.
    pub fn is_outcome(self) -> bool {
        self.rank() == 3
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::InProgress => "InProgress",
            Phase::SnapshotBackupDone => "SnapshotBackupDone",
            Phase::SnapshotRestoreDone => "SnapshotRestoreDone",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::PartiallyFailed => "PartiallyFailed",
            Phase::Cleanup => "Cleanup",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission state, independent of [`Phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchingStatus {
    Queued,
    Processing,
    Completed,
}

impl BatchingStatus {
    fn rank(self) -> u8 {
        match self {
            BatchingStatus::Queued => 1,
            BatchingStatus::Processing => 2,
            BatchingStatus::Completed => 3,
        }
    }

    pub fn can_advance(current: Option<BatchingStatus>, next: BatchingStatus) -> bool {
        match current {
            None => true,
            Some(c) => next.rank() >= c.rank(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

pub const CONDITION_ADMITTED: &str = "Admitted";
pub const CONDITION_STAGED: &str = "Staged";
pub const CONDITION_TRANSFER_COMPLETE: &str = "TransferComplete";
pub const CONDITION_CLEANED_UP: &str = "CleanedUp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    #[serde(default)]
    pub name: String,
}

/// Name and size of a persistent volume claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvcData {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: String,
}

/// Immutable copy of a backup's staged descriptors, embedded in a restore at
/// creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsbRef {
    #[serde(rename = "sourcePVCData", default)]
    pub source_pvc_data: PvcData,
    #[serde(rename = "resticrepository", default)]
    pub restic_repository: String,
    #[serde(default)]
    pub volume_snapshot_class_name: String,
}

impl VsbRef {
    /// Capture the reference from a finished backup. `None` until the backup
    /// has recorded everything a restore needs.
    pub fn from_backup(backup: &BackupJob) -> Option<Self> {
        let status = &backup.status;
        let pvc = status.source_pvc_data.clone()?;
        let repository = status.restic_repository.clone()?;
        Some(Self {
            source_pvc_data: pvc,
            restic_repository: repository,
            volume_snapshot_class_name: status.volume_snapshot_class_name.clone().unwrap_or_default(),
        })
    }
}

/// Observed data about the external transfer resource of a restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTransferData {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,
}

/// Status shared by backup and restore jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batching_status: Option<BatchingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,

    // Backup only.
    #[serde(rename = "sourcePVCData", default, skip_serializing_if = "Option::is_none")]
    pub source_pvc_data: Option<PvcData>,
    #[serde(rename = "resticrepository", default, skip_serializing_if = "Option::is_none")]
    pub restic_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,

    // Restore only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_destination_data: Option<ExternalTransferData>,
}

impl JobStatus {
    /// Move to `next` if that does not regress. Returns whether anything changed.
    pub fn advance(&mut self, next: Phase) -> bool {
        if self.phase == Some(next) || !Phase::can_advance(self.phase, next) {
            return false;
        }
        self.phase = Some(next);
        true
    }

    pub fn set_batching(&mut self, next: BatchingStatus) -> bool {
        if self.batching_status == Some(next)
            || !BatchingStatus::can_advance(self.batching_status, next)
        {
            return false;
        }
        self.batching_status = Some(next);
        true
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Insert or replace a condition. The transition time only moves when the
    /// status value flips. Returns whether anything changed.
    pub fn set_condition(&mut self, cond: Condition) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status
                    && existing.reason == cond.reason
                    && existing.message == cond.message
                {
                    return false;
                }
                if existing.status != cond.status {
                    existing.last_transition_time = cond.last_transition_time;
                }
                existing.status = cond.status;
                existing.reason = cond.reason;
                existing.message = cond.message;
                true
            }
            None => {
                self.conditions.push(cond);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJobSpec {
    /// Cluster-scoped snapshot content the backup is taken from.
    #[serde(default)]
    pub volume_snapshot_content: LocalObjectReference,
    #[serde(default)]
    pub restic_secret_ref: LocalObjectReference,
    #[serde(default)]
    pub protected_namespace: String,
}

/// A `VolumeSnapshotBackup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BackupJobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJobSpec {
    #[serde(default)]
    pub restic_secret_ref: LocalObjectReference,
    #[serde(rename = "volumeSnapshotMoverBackupRef", default)]
    pub backup_ref: VsbRef,
    #[serde(default)]
    pub protected_namespace: String,
}

/// A `VolumeSnapshotRestore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreJob {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RestoreJobSpec,
    #[serde(default)]
    pub status: JobStatus,
}
