//! Registry of object kinds known to the store.
//!
//! A [`KindRegistry`] is built once at startup and shared by reference with
//! every component that needs to resolve kinds; nothing registers kinds
//! implicitly.

use std::collections::HashMap;

use super::error::StoreError;

/// Static description of an object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KindDescriptor {
    pub kind: &'static str,
    pub api_version: &'static str,
    pub namespaced: bool,
}

impl KindDescriptor {
    /// The namespace an object of this kind lives in, given a requested one.
    pub fn scope<'a>(&self, namespace: Option<&'a str>) -> Option<&'a str> {
        if self.namespaced { namespace } else { None }
    }
}

pub const BACKUP_JOB: KindDescriptor = KindDescriptor {
    kind: "VolumeSnapshotBackup",
    api_version: "datamover.oadp.openshift.io/v1alpha1",
    namespaced: true,
};

pub const RESTORE_JOB: KindDescriptor = KindDescriptor {
    kind: "VolumeSnapshotRestore",
    api_version: "datamover.oadp.openshift.io/v1alpha1",
    namespaced: true,
};

pub const PERSISTENT_VOLUME_CLAIM: KindDescriptor = KindDescriptor {
    kind: "PersistentVolumeClaim",
    api_version: "v1",
    namespaced: true,
};

pub const POD: KindDescriptor = KindDescriptor {
    kind: "Pod",
    api_version: "v1",
    namespaced: true,
};

pub const SECRET: KindDescriptor = KindDescriptor {
    kind: "Secret",
    api_version: "v1",
    namespaced: true,
};

pub const VOLUME_SNAPSHOT: KindDescriptor = KindDescriptor {
    kind: "VolumeSnapshot",
    api_version: "snapshot.storage.k8s.io/v1",
    namespaced: true,
};

pub const VOLUME_SNAPSHOT_CONTENT: KindDescriptor = KindDescriptor {
    kind: "VolumeSnapshotContent",
    api_version: "snapshot.storage.k8s.io/v1",
    namespaced: false,
};

pub const REPLICATION_SOURCE: KindDescriptor = KindDescriptor {
    kind: "ReplicationSource",
    api_version: "volsync.backube/v1alpha1",
    namespaced: true,
};

pub const REPLICATION_DESTINATION: KindDescriptor = KindDescriptor {
    kind: "ReplicationDestination",
    api_version: "volsync.backube/v1alpha1",
    namespaced: true,
};

const DEFAULT_KINDS: [KindDescriptor; 9] = [
    BACKUP_JOB,
    RESTORE_JOB,
    PERSISTENT_VOLUME_CLAIM,
    POD,
    SECRET,
    VOLUME_SNAPSHOT,
    VOLUME_SNAPSHOT_CONTENT,
    REPLICATION_SOURCE,
    REPLICATION_DESTINATION,
];

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: HashMap<&'static str, KindDescriptor>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the job kinds and every kind they stage.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in DEFAULT_KINDS {
            registry.register(kind);
        }
        registry
    }

    pub fn register(&mut self, kind: KindDescriptor) -> &mut Self {
        self.kinds.insert(kind.kind, kind);
        self
    }

    pub fn lookup(&self, kind: &str) -> Result<&KindDescriptor, StoreError> {
        self.kinds
            .get(kind)
            .ok_or_else(|| StoreError::UnknownKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }
}

/// The part a staged resource plays for its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedRole {
    ClonedClaim,
    MountPod,
    ClonedSnapshot,
    ClonedSnapshotContent,
    Credential,
    TransferTrigger,
}

/// One deletable staged kind: how to find it in bulk (by kind and owner
/// label) and by name (through its role).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedKind {
    pub kind: KindDescriptor,
    pub role: StagedRole,
}

pub const BACKUP_STAGED_KINDS: &[StagedKind] = &[
    StagedKind {
        kind: PERSISTENT_VOLUME_CLAIM,
        role: StagedRole::ClonedClaim,
    },
    StagedKind {
        kind: POD,
        role: StagedRole::MountPod,
    },
    StagedKind {
        kind: VOLUME_SNAPSHOT,
        role: StagedRole::ClonedSnapshot,
    },
    StagedKind {
        kind: VOLUME_SNAPSHOT_CONTENT,
        role: StagedRole::ClonedSnapshotContent,
    },
    StagedKind {
        kind: SECRET,
        role: StagedRole::Credential,
    },
    StagedKind {
        kind: REPLICATION_SOURCE,
        role: StagedRole::TransferTrigger,
    },
];

pub const RESTORE_STAGED_KINDS: &[StagedKind] = &[
    StagedKind {
        kind: PERSISTENT_VOLUME_CLAIM,
        role: StagedRole::ClonedClaim,
    },
    StagedKind {
        kind: SECRET,
        role: StagedRole::Credential,
    },
    StagedKind {
        kind: REPLICATION_DESTINATION,
        role: StagedRole::TransferTrigger,
    },
];
