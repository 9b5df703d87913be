//! Executes [`next_step`] decisions for one job kind.
//!
//! A pass loads the job, observes admission and the transfer trigger, asks the
//! state machine for the next step and performs it. Steps that make progress
//! are followed by another observation within the same pass; waiting steps end
//! the pass with a requeue hint.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::batching::BatchingController;
use super::bridge::{self, TransferObservation, TransferState};
use super::cleanup::{CleanupCoordinator, CleanupOutcome};
use super::error::ReconcileError;
use super::job::{MoverJob, STAGED_RESOURCES_FINALIZER};
use super::models::{
    BatchingStatus, CONDITION_ADMITTED, CONDITION_STAGED, CONDITION_TRANSFER_COMPLETE, Condition,
    ConditionStatus, JobRef, JobStatus, Phase,
};
use super::notifications::{JobEvent, NotificationChannel};
use super::registry::RESTORE_JOB;
use super::staging::StageOutcome;
use super::state_machine::{Observed, Step, next_step};
use super::status::{load, patch_metadata, patch_status};
use super::store::ResourceStore;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub verify_cleanup: bool,
    pub conflict_retries: u32,
    /// Requeue delay while waiting on admission or the transfer engine.
    pub poll_interval: Duration,
    /// Upper bound on steps executed in one pass.
    pub max_steps: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            verify_cleanup: true,
            conflict_retries: 5,
            poll_interval: Duration::from_secs(5),
            max_steps: 16,
        }
    }
}

/// What the controller should do after a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
    /// Jobs promoted out of the batching queue during the pass.
    pub promoted: Vec<JobRef>,
    /// Last step executed.
    pub last_step: Option<&'static str>,
}

enum Flow {
    Continue,
    Done,
}

pub struct Reconciler<J> {
    store: Arc<dyn ResourceStore>,
    batching: BatchingController,
    cleanup: CleanupCoordinator,
    settings: ReconcilerSettings,
    notifier: Option<Arc<dyn NotificationChannel>>,
    _job: PhantomData<fn() -> J>,
}

impl<J> Clone for Reconciler<J> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            batching: self.batching.clone(),
            cleanup: self.cleanup.clone(),
            settings: self.settings.clone(),
            notifier: self.notifier.clone(),
            _job: PhantomData,
        }
    }
}

impl<J: MoverJob> Reconciler<J> {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        batching: BatchingController,
        settings: ReconcilerSettings,
    ) -> Self {
        let cleanup = CleanupCoordinator::new(
            store.clone(),
            batching.clone(),
            settings.verify_cleanup,
            settings.conflict_retries,
        );
        Self {
            store,
            batching,
            cleanup,
            settings,
            notifier: None,
            _job: PhantomData,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn batching(&self) -> &BatchingController {
        &self.batching
    }

    pub fn cleanup(&self) -> &CleanupCoordinator {
        &self.cleanup
    }

    /// Drive one job as far as it can go right now.
    pub async fn reconcile(&self, key: &JobRef) -> Result<Action, ReconcileError> {
        let mut action = Action::default();

        for _ in 0..self.settings.max_steps.max(1) {
            let Some(job) = load::<J>(self.store.as_ref(), key).await? else {
                // Gone without teardown; make sure it holds no slot.
                action.promoted.extend(self.batching.release(key).await);
                return Ok(action);
            };

            let (observed, transfer) = self.observe(&job).await?;
            let step = next_step(&observed);
            debug!(
                kind = J::KIND.kind,
                job = %key,
                phase = ?observed.phase,
                step = step.name(),
                "Reconcile step"
            );
            action.last_step = Some(step.name());

            match self.execute(&job, step, transfer, &mut action).await? {
                Flow::Continue => continue,
                Flow::Done => return Ok(action),
            }
        }

        warn!(kind = J::KIND.kind, job = %key, "Step budget exhausted, requeueing");
        action.requeue_after = Some(self.settings.poll_interval);
        Ok(action)
    }

    async fn observe(
        &self,
        job: &J,
    ) -> Result<(Observed, Option<TransferObservation>), ReconcileError> {
        let meta = job.metadata();
        let status = job.status();
        let mut observed = Observed {
            phase: status.phase,
            deleting: meta.is_deleting(),
            has_finalizer: meta.has_finalizer(STAGED_RESOURCES_FINALIZER),
            spec_error: job.validate().err().map(|e| e.to_string()),
            persisted_batching: status.batching_status,
            admission: None,
            transfer: None,
        };

        if observed.needs_admission() {
            let admission = self
                .batching
                .admit(&job.job_ref(), meta.creation_timestamp, status.batching_status)
                .await;
            observed.admission = Some(admission);
        }

        let mut transfer = None;
        if observed.needs_transfer() {
            let seen = bridge::observe(self.store.as_ref(), job).await?;
            observed.transfer = seen.exists.then_some(seen.state);
            transfer = Some(seen);
        }

        Ok((observed, transfer))
    }

    async fn execute(
        &self,
        job: &J,
        step: Step,
        transfer: Option<TransferObservation>,
        action: &mut Action,
    ) -> Result<Flow, ReconcileError> {
        let key = job.job_ref();
        let retries = self.settings.conflict_retries;
        let store = self.store.as_ref();

        match step {
            Step::Teardown => {
                match self.cleanup.teardown::<J>(&key).await? {
                    CleanupOutcome::Pending { remaining } => {
                        debug!(job = %key, remaining = remaining.len(), "Teardown pending");
                        action.requeue_after = Some(self.settings.poll_interval);
                    }
                    CleanupOutcome::Completed { promoted, .. } => {
                        action.promoted.extend(promoted);
                    }
                    CleanupOutcome::NotReady(_) | CleanupOutcome::AlreadyDone => {}
                }
                Ok(Flow::Done)
            }

            Step::AddFinalizer => {
                patch_metadata::<J, _>(store, &key, retries, |meta| {
                    if meta.is_deleting() || meta.has_finalizer(STAGED_RESOURCES_FINALIZER) {
                        return false;
                    }
                    meta.finalizers.push(STAGED_RESOURCES_FINALIZER.to_string());
                    true
                })
                .await?;
                Ok(Flow::Continue)
            }

            Step::Reject(reason) => {
                let error = job
                    .validate()
                    .err()
                    .unwrap_or(ReconcileError::Validation(reason));
                self.fail(&key, CONDITION_ADMITTED, &error, action).await?;
                Ok(Flow::Done)
            }

            Step::Start(admission) => {
                let now = Utc::now();
                patch_status::<J, _>(store, &key, retries, |status| {
                    if status.phase.is_some() {
                        return false;
                    }
                    status.advance(Phase::InProgress);
                    status.start_timestamp.get_or_insert(now);
                    status.set_batching(admission);
                    status.set_condition(admission_condition(admission));
                    true
                })
                .await?;
                info!(kind = J::KIND.kind, job = %key, batching = ?admission, "Job started");
                Ok(Flow::Continue)
            }

            Step::RecordAdmission(admission) => {
                patch_status::<J, _>(store, &key, retries, |status| {
                    if status.phase != Some(Phase::InProgress) {
                        return false;
                    }
                    let changed = status.set_batching(admission);
                    status.set_condition(admission_condition(admission)) | changed
                })
                .await?;
                Ok(Flow::Continue)
            }

            Step::AwaitAdmission => {
                action.requeue_after = Some(self.settings.poll_interval);
                Ok(Flow::Done)
            }

            Step::Stage => self.stage(job, action).await,

            Step::AwaitTransfer => {
                if let Some(seen) = transfer {
                    patch_status::<J, _>(store, &key, retries, |status| {
                        if status.phase != Some(Phase::InProgress) {
                            return false;
                        }
                        let reason = match seen.state {
                            TransferState::Running => "TransferRunning",
                            _ => "TransferPending",
                        };
                        let mut changed = status.set_condition(Condition::new(
                            CONDITION_TRANSFER_COMPLETE,
                            ConditionStatus::False,
                            reason,
                            seen.name.clone(),
                        ));
                        if let (Some(data), Some(started)) =
                            (status.replication_destination_data.as_mut(), seen.started_at)
                        {
                            if data.start_timestamp.is_none() {
                                data.start_timestamp = Some(started);
                                changed = true;
                            }
                        }
                        changed
                    })
                    .await?;
                }
                action.requeue_after = Some(self.settings.poll_interval);
                Ok(Flow::Done)
            }

            Step::FinishTransfer => {
                let Some(seen) = transfer else {
                    action.requeue_after = Some(self.settings.poll_interval);
                    return Ok(Flow::Done);
                };
                let Some(results) = job.transfer_results(store, &seen).await? else {
                    debug!(job = %key, "Transfer finished but results are not available yet");
                    action.requeue_after = Some(self.settings.poll_interval);
                    return Ok(Flow::Done);
                };
                let patched = patch_status::<J, _>(store, &key, retries, |status| {
                    if status.phase != Some(Phase::InProgress) {
                        return false;
                    }
                    results.apply(status);
                    record_transfer_end(status, &seen);
                    status.advance(J::TRANSFER_DONE);
                    status.set_batching(BatchingStatus::Completed);
                    status.set_condition(Condition::new(
                        CONDITION_TRANSFER_COMPLETE,
                        ConditionStatus::True,
                        "TransferSucceeded",
                        seen.name.clone(),
                    ));
                    true
                })
                .await?;
                if patched.is_some_and(|p| p.changed) {
                    info!(kind = J::KIND.kind, job = %key, "Transfer finished");
                    action.promoted.extend(self.batching.release(&key).await);
                }
                Ok(Flow::Continue)
            }

            Step::FailTransfer => {
                let seen = transfer;
                let message = seen
                    .as_ref()
                    .and_then(|s| s.message.clone())
                    .unwrap_or_else(|| "transfer engine reported failure".to_string());
                let now = Utc::now();
                let patched = patch_status::<J, _>(store, &key, retries, |status| {
                    if status.phase != Some(Phase::InProgress) {
                        return false;
                    }
                    if let Some(seen) = &seen {
                        record_transfer_end(status, seen);
                    }
                    status.advance(Phase::PartiallyFailed);
                    status.set_batching(BatchingStatus::Completed);
                    status.completion_timestamp.get_or_insert(now);
                    status.set_condition(Condition::new(
                        CONDITION_TRANSFER_COMPLETE,
                        ConditionStatus::False,
                        "TransferFailed",
                        message.clone(),
                    ));
                    true
                })
                .await?;
                if patched.is_some_and(|p| p.changed) {
                    warn!(kind = J::KIND.kind, job = %key, %message, "Transfer failed");
                    action.promoted.extend(self.batching.release(&key).await);
                    self.notify(JobEvent::PartiallyFailed {
                        kind: J::KIND.kind.to_string(),
                        job: key.to_string(),
                        message,
                    })
                    .await;
                }
                Ok(Flow::Done)
            }

            Step::Cleanup => match self.cleanup.run::<J>(&key).await? {
                CleanupOutcome::Completed { deleted, promoted } => {
                    action.promoted.extend(promoted);
                    let duration_secs = load::<J>(store, &key).await?.and_then(|job| {
                        let status = job.status();
                        Some((status.completion_timestamp? - status.start_timestamp?).num_seconds())
                    });
                    self.notify(JobEvent::Completed {
                        kind: J::KIND.kind.to_string(),
                        job: key.to_string(),
                        deleted,
                        duration_secs,
                    })
                    .await;
                    Ok(Flow::Continue)
                }
                CleanupOutcome::Pending { .. } | CleanupOutcome::NotReady(_) => {
                    action.requeue_after = Some(self.settings.poll_interval);
                    Ok(Flow::Done)
                }
                CleanupOutcome::AlreadyDone => Ok(Flow::Continue),
            },

            Step::Settled => Ok(Flow::Done),
        }
    }

    async fn stage(&self, job: &J, action: &mut Action) -> Result<Flow, ReconcileError> {
        let key = job.job_ref();
        let retries = self.settings.conflict_retries;
        let store = self.store.as_ref();

        match job.stage(store).await {
            Ok(StageOutcome::Staged(staged)) => {
                let track_transfer = J::KIND == RESTORE_JOB;
                let patched = patch_status::<J, _>(store, &key, retries, |status| {
                    if status.phase != Some(Phase::InProgress) {
                        return false;
                    }
                    let changed = staged.apply(status, track_transfer);
                    status.set_condition(Condition::new(
                        CONDITION_STAGED,
                        ConditionStatus::True,
                        "Staged",
                        format!("transfer trigger {}", staged.transfer_name),
                    )) | changed
                })
                .await?;
                if patched.is_some_and(|p| p.changed) && !staged.created.is_empty() {
                    self.notify(JobEvent::TransferStarted {
                        kind: J::KIND.kind.to_string(),
                        job: key.to_string(),
                        transfer: staged.transfer_name.clone(),
                    })
                    .await;
                }
                Ok(Flow::Continue)
            }
            Ok(StageOutcome::Waiting(reason)) => {
                debug!(job = %key, %reason, "Staging waiting on inputs");
                patch_status::<J, _>(store, &key, retries, |status| {
                    status.set_condition(Condition::new(
                        CONDITION_STAGED,
                        ConditionStatus::False,
                        "Waiting",
                        reason.clone(),
                    ))
                })
                .await?;
                action.requeue_after = Some(self.settings.poll_interval);
                Ok(Flow::Done)
            }
            Err(error) if error.is_permanent() => {
                self.fail(&key, CONDITION_STAGED, &error, action).await?;
                Ok(Flow::Done)
            }
            Err(error) => Err(error),
        }
    }

    /// Record a permanent failure as `Failed` and give the slot back. Staged
    /// resources that already exist are left for teardown.
    async fn fail(
        &self,
        key: &JobRef,
        condition: &str,
        error: &ReconcileError,
        action: &mut Action,
    ) -> Result<(), ReconcileError> {
        let now = Utc::now();
        let message = error.to_string();
        let patched = patch_status::<J, _>(
            self.store.as_ref(),
            key,
            self.settings.conflict_retries,
            |status| {
                if !status.advance(Phase::Failed) {
                    return false;
                }
                status.completion_timestamp.get_or_insert(now);
                status.set_condition(Condition::new(
                    condition,
                    ConditionStatus::False,
                    error.reason(),
                    message.clone(),
                ));
                true
            },
        )
        .await?;

        action.promoted.extend(self.batching.release(key).await);
        if patched.is_some_and(|p| p.changed) {
            warn!(kind = J::KIND.kind, job = %key, error = %message, "Job failed");
            self.notify(JobEvent::Failed {
                kind: J::KIND.kind.to_string(),
                job: key.to_string(),
                error: message,
            })
            .await;
        }
        Ok(())
    }

    async fn notify(&self, event: JobEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let job = event.job().to_string();
        if let Err(e) = notifier.notify(event).await {
            warn!(job = %job, error = %e, "Failed to send notification");
        }
    }
}

fn admission_condition(admission: BatchingStatus) -> Condition {
    match admission {
        BatchingStatus::Queued => Condition::new(
            CONDITION_ADMITTED,
            ConditionStatus::False,
            "Queued",
            "waiting for a free transfer slot",
        ),
        _ => Condition::new(CONDITION_ADMITTED, ConditionStatus::True, "Admitted", ""),
    }
}

fn record_transfer_end(status: &mut JobStatus, seen: &TransferObservation) {
    if let Some(data) = status.replication_destination_data.as_mut() {
        if data.start_timestamp.is_none() {
            data.start_timestamp = seen.started_at;
        }
        if data.completion_timestamp.is_none() {
            data.completion_timestamp = seen.completed_at;
        }
    }
}
