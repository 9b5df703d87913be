//! Reads the external transfer resource and turns its status into a
//! [`TransferState`].
//!
//! The transfer engine owns its resource's status; this side only reads it.
//! A run counts as finished once `lastSyncTime` is set and `lastManualSync`
//! echoes the manual trigger we wrote into the spec.

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::error::ReconcileError;
use super::job::MoverJob;
use super::models::StoredObject;
use super::store::{ResourceStore, get_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl TransferState {
    pub fn is_finished(self) -> bool {
        matches!(self, TransferState::Succeeded | TransferState::Failed)
    }
}

/// A snapshot of the transfer resource as seen by one reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferObservation {
    pub name: String,
    pub exists: bool,
    pub state: TransferState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Snapshot produced by a restore transfer.
    pub latest_image: Option<String>,
}

pub async fn observe<J: MoverJob>(
    store: &dyn ResourceStore,
    job: &J,
) -> Result<TransferObservation, ReconcileError> {
    let name = job.staged_names().transfer;
    let obj = get_opt(
        store,
        &J::TRANSFER_KIND,
        Some(job.protected_namespace()),
        &name,
    )
    .await?;
    // A namesake job elsewhere may hold the name; its run is not ours.
    let obj = obj.filter(|obj| {
        let owned = job.owns(obj);
        if !owned {
            debug!(job = %job.job_ref(), transfer = %name, "Transfer resource belongs to another job");
        }
        owned
    });
    let observed = interpret(&name, obj.as_ref());
    trace!(job = %job.job_ref(), transfer = %name, state = ?observed.state, "Observed transfer");
    Ok(observed)
}

/// Map a transfer resource (or its absence) to an observation.
pub fn interpret(name: &str, obj: Option<&StoredObject>) -> TransferObservation {
    let Some(obj) = obj else {
        return TransferObservation {
            name: name.to_string(),
            exists: false,
            state: TransferState::NotStarted,
            started_at: None,
            completed_at: None,
            message: None,
            latest_image: None,
        };
    };

    let started_at = timestamp(obj, "lastSyncStartTime");
    let completed_at = timestamp(obj, "lastSyncTime");
    let trigger = obj.spec_str("trigger.manual");
    let acknowledged = trigger.is_some() && obj.status_str("lastManualSync") == trigger;
    let result = obj.status_str("latestMoverStatus.result");

    let state = if result == Some("Failed") {
        TransferState::Failed
    } else if completed_at.is_some() && acknowledged {
        TransferState::Succeeded
    } else if started_at.is_some() {
        TransferState::Running
    } else {
        TransferState::NotStarted
    };

    TransferObservation {
        name: name.to_string(),
        exists: true,
        state,
        started_at,
        completed_at,
        message: obj
            .status_str("latestMoverStatus.logs")
            .map(str::to_string),
        latest_image: obj.status_str("latestImage.name").map(str::to_string),
    }
}

fn timestamp(obj: &StoredObject, path: &str) -> Option<DateTime<Utc>> {
    obj.status_str(path)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
