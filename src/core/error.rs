//! Error taxonomy for store access and job reconciliation.

use thiserror::Error;

/// Errors returned by a [`ResourceStore`](crate::core::store::ResourceStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: String, name: String },

    /// The object changed since it was read (resource version mismatch).
    #[error("conflict writing {kind} {name:?}: object was modified")]
    Conflict { kind: String, name: String },

    #[error("kind {0:?} is not registered")]
    UnknownKind(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    /// Store unreachable or failed internally. Retried with backoff.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn conflict(kind: &str, name: &str) -> Self {
        Self::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Conflict { .. })
    }
}

/// Errors surfaced by a reconcile pass.
///
/// Permanent errors drive the job to `Failed`; everything else is returned to
/// the controller, which requeues the job with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid job spec: {0}")]
    Validation(String),

    #[error("malformed {kind} object: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} {name:?} already exists and is owned by another job")]
    Ownership { kind: String, name: String },

    #[error("gave up writing {0} after {1} conflicting attempts")]
    ConflictRetriesExhausted(String, u32),
}

impl ReconcileError {
    pub fn decode(kind: &str, source: serde_json::Error) -> Self {
        Self::Decode {
            kind: kind.to_string(),
            source,
        }
    }

    /// Whether retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Decode { .. } | Self::Ownership { .. } => true,
            Self::Store(e) => matches!(e, StoreError::Invalid(_) | StoreError::UnknownKind(_)),
            Self::ConflictRetriesExhausted(..) => false,
        }
    }

    /// Short machine-readable reason used in job conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "InvalidSpec",
            Self::Decode { .. } => "MalformedObject",
            Self::Ownership { .. } => "OwnershipCollision",
            Self::Store(StoreError::Invalid(_)) => "Rejected",
            Self::Store(_) => "StoreError",
            Self::ConflictRetriesExhausted(..) => "Conflict",
        }
    }
}
