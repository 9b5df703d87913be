//! Reclaiming staged resources.
//!
//! Bulk deletion goes by kind and owner label in the protected namespace; the
//! optional verification pass then looks each staged resource up by its
//! deterministic name. Every step tolerates being repeated, so a pass that
//! fails half way is simply run again.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::batching::BatchingController;
use super::error::ReconcileError;
use super::job::{MoverJob, STAGED_RESOURCES_FINALIZER};
use super::models::{
    BatchingStatus, CONDITION_CLEANED_UP, Condition, ConditionStatus, JobRef, ObjectKey, Phase,
};
use super::status::{load, patch_metadata, patch_status};
use super::store::{ResourceStore, get_opt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The job has not reached its transfer-done phase.
    NotReady(Option<Phase>),
    /// Cleanup already happened, or the job is gone.
    AlreadyDone,
    /// Deletes were issued but some resources still exist.
    Pending { remaining: Vec<ObjectKey> },
    Completed {
        deleted: usize,
        promoted: Vec<JobRef>,
    },
}

#[derive(Clone)]
pub struct CleanupCoordinator {
    store: Arc<dyn ResourceStore>,
    batching: BatchingController,
    verify_enabled: bool,
    conflict_retries: u32,
}

impl CleanupCoordinator {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        batching: BatchingController,
        verify_enabled: bool,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            batching,
            verify_enabled,
            conflict_retries,
        }
    }

    /// Clean up after a finished transfer and mark the job `Completed`.
    pub async fn run<J: MoverJob>(&self, key: &JobRef) -> Result<CleanupOutcome, ReconcileError> {
        let Some(job) = load::<J>(self.store.as_ref(), key).await? else {
            return Ok(CleanupOutcome::AlreadyDone);
        };
        match job.status().phase {
            Some(Phase::Completed) => return Ok(CleanupOutcome::AlreadyDone),
            Some(phase) if phase.is_transfer_done() => {}
            other => {
                debug!(kind = J::KIND.kind, job = %key, phase = ?other, "Cleanup not ready");
                return Ok(CleanupOutcome::NotReady(other));
            }
        }

        let deleted = self.reclaim(&job).await?;
        if let Some(remaining) = self.leftovers(&job).await? {
            return Ok(CleanupOutcome::Pending { remaining });
        }

        let now = Utc::now();
        let patched = patch_status::<J, _>(self.store.as_ref(), key, self.conflict_retries, |status| {
            let Some(phase) = status.phase else {
                return false;
            };
            if !phase.is_transfer_done() {
                return false;
            }
            status.advance(Phase::Completed);
            status.set_batching(BatchingStatus::Completed);
            status.completion_timestamp.get_or_insert(now);
            status.set_condition(Condition::new(
                CONDITION_CLEANED_UP,
                ConditionStatus::True,
                "StagedResourcesDeleted",
                format!("{deleted} staged resources deleted"),
            ));
            true
        })
        .await?;

        let Some(patched) = patched else {
            return Ok(CleanupOutcome::AlreadyDone);
        };
        let phase = patched.job.status().phase;
        if phase != Some(Phase::Completed) {
            return Ok(CleanupOutcome::NotReady(phase));
        }
        if !patched.changed {
            return Ok(CleanupOutcome::AlreadyDone);
        }

        let promoted = self.batching.release(key).await;
        info!(kind = J::KIND.kind, job = %key, deleted, "Cleanup completed");
        Ok(CleanupOutcome::Completed { deleted, promoted })
    }

    /// Reclaim everything for a job being deleted, then drop its finalizer so
    /// the store can remove it.
    pub async fn teardown<J: MoverJob>(
        &self,
        key: &JobRef,
    ) -> Result<CleanupOutcome, ReconcileError> {
        let Some(job) = load::<J>(self.store.as_ref(), key).await? else {
            return Ok(CleanupOutcome::AlreadyDone);
        };
        if !job.metadata().has_finalizer(STAGED_RESOURCES_FINALIZER) {
            return Ok(CleanupOutcome::AlreadyDone);
        }

        patch_status::<J, _>(self.store.as_ref(), key, self.conflict_retries, |status| {
            status.advance(Phase::Cleanup)
        })
        .await?;

        let deleted = self.reclaim(&job).await?;
        if let Some(remaining) = self.leftovers(&job).await? {
            return Ok(CleanupOutcome::Pending { remaining });
        }

        let promoted = self.batching.release(key).await;
        patch_metadata::<J, _>(self.store.as_ref(), key, self.conflict_retries, |meta| {
            let before = meta.finalizers.len();
            meta.finalizers.retain(|f| f != STAGED_RESOURCES_FINALIZER);
            meta.finalizers.len() != before
        })
        .await?;

        info!(kind = J::KIND.kind, job = %key, deleted, "Torn down deleted job");
        Ok(CleanupOutcome::Completed { deleted, promoted })
    }

    /// Delete every staged kind by owner label. The first failure aborts.
    pub async fn reclaim<J: MoverJob>(&self, job: &J) -> Result<usize, ReconcileError> {
        let selector = job.owner_selector();
        let namespace = job.protected_namespace();
        let mut deleted = 0;
        for staged in J::staged_kinds() {
            let scope = staged.kind.scope(Some(namespace));
            let count = self
                .store
                .delete_all_of(&staged.kind, scope, &selector)
                .await
                .inspect_err(|e| {
                    warn!(job = %job.job_ref(), kind = staged.kind.kind, error = %e, "Bulk delete failed");
                })?;
            if count > 0 {
                debug!(job = %job.job_ref(), kind = staged.kind.kind, count, "Deleted staged resources");
            }
            deleted += count;
        }
        Ok(deleted)
    }

    /// Look up each staged resource by name. Returns what is still present
    /// and owned by `job`.
    pub async fn verify<J: MoverJob>(&self, job: &J) -> Result<Vec<ObjectKey>, ReconcileError> {
        let names = job.staged_names();
        let namespace = job.protected_namespace();
        let mut remaining = Vec::new();
        for staged in J::staged_kinds() {
            let Some(name) = names.name(staged.role) else {
                continue;
            };
            let scope = staged.kind.scope(Some(namespace));
            if let Some(obj) = get_opt(self.store.as_ref(), &staged.kind, scope, name).await? {
                // A namesake job's resource is not ours to wait for.
                if job.owns(&obj) {
                    remaining.push(obj.key());
                }
            }
        }
        Ok(remaining)
    }

    async fn leftovers<J: MoverJob>(
        &self,
        job: &J,
    ) -> Result<Option<Vec<ObjectKey>>, ReconcileError> {
        if !self.verify_enabled {
            return Ok(None);
        }
        let remaining = self.verify(job).await?;
        if remaining.is_empty() {
            return Ok(None);
        }
        warn!(
            job = %job.job_ref(),
            remaining = remaining.len(),
            "Staged resources survived cleanup"
        );
        Ok(Some(remaining))
    }
}
