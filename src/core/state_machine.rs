//! The per-job decision function.
//!
//! [`next_step`] is pure: given what one reconcile pass observed it names the
//! single next action. The reconciler executes that action, re-observes and
//! asks again until the answer is to wait.

use super::bridge::TransferState;
use super::models::{BatchingStatus, Phase};

/// Everything the decision depends on.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub phase: Option<Phase>,
    pub deleting: bool,
    pub has_finalizer: bool,
    /// Why the spec can never be staged, if it cannot.
    pub spec_error: Option<String>,
    /// Batching status recorded on the job.
    pub persisted_batching: Option<BatchingStatus>,
    /// What the admission controller answered this pass. Only asked while the
    /// job can still be admitted.
    pub admission: Option<BatchingStatus>,
    /// State of the transfer trigger, `None` while it does not exist.
    pub transfer: Option<TransferState>,
}

impl Observed {
    /// Whether the admission controller must be consulted before deciding.
    pub fn needs_admission(&self) -> bool {
        !self.deleting
            && self.has_finalizer
            && self.spec_error.is_none()
            && matches!(self.phase, None | Some(Phase::InProgress))
    }

    /// Whether the transfer trigger must be observed before deciding.
    pub fn needs_transfer(&self) -> bool {
        self.needs_admission()
            && self.phase == Some(Phase::InProgress)
            && matches!(
                self.admission,
                Some(BatchingStatus::Processing | BatchingStatus::Completed)
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Deletion in flight: reclaim staged resources, then drop the finalizer.
    Teardown,
    AddFinalizer,
    /// Spec is invalid; fail without staging.
    Reject(String),
    /// First pass: enter `InProgress` with the given admission.
    Start(BatchingStatus),
    RecordAdmission(BatchingStatus),
    AwaitAdmission,
    /// Create staged resources, trigger last.
    Stage,
    AwaitTransfer,
    FinishTransfer,
    FailTransfer,
    /// Hand off to the cleanup coordinator.
    Cleanup,
    Settled,
}

impl Step {
    /// Steps after which the pass re-observes and continues.
    pub fn continues(&self) -> bool {
        matches!(
            self,
            Step::AddFinalizer
                | Step::Start(_)
                | Step::RecordAdmission(_)
                | Step::Stage
                | Step::FinishTransfer
                | Step::Cleanup
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::Teardown => "teardown",
            Step::AddFinalizer => "add-finalizer",
            Step::Reject(_) => "reject",
            Step::Start(_) => "start",
            Step::RecordAdmission(_) => "record-admission",
            Step::AwaitAdmission => "await-admission",
            Step::Stage => "stage",
            Step::AwaitTransfer => "await-transfer",
            Step::FinishTransfer => "finish-transfer",
            Step::FailTransfer => "fail-transfer",
            Step::Cleanup => "cleanup",
            Step::Settled => "settled",
        }
    }
}

pub fn next_step(observed: &Observed) -> Step {
    if observed.deleting {
        return if observed.has_finalizer {
            Step::Teardown
        } else {
            Step::Settled
        };
    }
    if !observed.has_finalizer {
        return Step::AddFinalizer;
    }
    if let Some(reason) = &observed.spec_error {
        if matches!(observed.phase, None | Some(Phase::InProgress)) {
            return Step::Reject(reason.clone());
        }
    }

    match observed.phase {
        None => match observed.admission {
            Some(admission) => Step::Start(admission),
            None => Step::AwaitAdmission,
        },
        Some(Phase::InProgress) => in_progress(observed),
        Some(phase) if phase.is_transfer_done() => Step::Cleanup,
        Some(_) => Step::Settled,
    }
}

fn in_progress(observed: &Observed) -> Step {
    let Some(admission) = observed.admission else {
        return Step::AwaitAdmission;
    };
    if observed.persisted_batching != Some(admission) {
        return Step::RecordAdmission(admission);
    }
    if admission == BatchingStatus::Queued {
        return Step::AwaitAdmission;
    }
    match observed.transfer {
        None => Step::Stage,
        Some(TransferState::NotStarted | TransferState::Running) => Step::AwaitTransfer,
        Some(TransferState::Succeeded) => Step::FinishTransfer,
        Some(TransferState::Failed) => Step::FailTransfer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Observed {
        Observed {
            phase: None,
            deleting: false,
            has_finalizer: true,
            spec_error: None,
            persisted_batching: None,
            admission: None,
            transfer: None,
        }
    }

    fn running(admission: BatchingStatus) -> Observed {
        Observed {
            phase: Some(Phase::InProgress),
            persisted_batching: Some(admission),
            admission: Some(admission),
            ..fresh()
        }
    }

    #[test]
    fn test_deletion_wins_over_everything() {
        let observed = Observed {
            deleting: true,
            phase: Some(Phase::InProgress),
            spec_error: Some("bad".into()),
            ..fresh()
        };
        assert_eq!(next_step(&observed), Step::Teardown);
        assert!(!observed.needs_admission());

        let released = Observed {
            has_finalizer: false,
            ..observed
        };
        assert_eq!(next_step(&released), Step::Settled);
    }

    #[test]
    fn test_finalizer_added_first() {
        let observed = Observed {
            has_finalizer: false,
            ..fresh()
        };
        assert_eq!(next_step(&observed), Step::AddFinalizer);
    }

    #[test]
    fn test_invalid_spec_rejected_before_outcome_only() {
        let observed = Observed {
            spec_error: Some("missing secret".into()),
            ..fresh()
        };
        assert_eq!(next_step(&observed), Step::Reject("missing secret".into()));

        let settled = Observed {
            phase: Some(Phase::Failed),
            ..observed
        };
        assert_eq!(next_step(&settled), Step::Settled);
    }

    #[test]
    fn test_new_job_starts_with_admission() {
        let observed = Observed {
            admission: Some(BatchingStatus::Queued),
            ..fresh()
        };
        assert!(observed.needs_admission());
        assert_eq!(next_step(&observed), Step::Start(BatchingStatus::Queued));
    }

    #[test]
    fn test_promotion_is_recorded() {
        let observed = Observed {
            admission: Some(BatchingStatus::Processing),
            ..running(BatchingStatus::Queued)
        };
        assert_eq!(
            next_step(&observed),
            Step::RecordAdmission(BatchingStatus::Processing)
        );
        assert_eq!(next_step(&running(BatchingStatus::Queued)), Step::AwaitAdmission);
    }

    #[test]
    fn test_transfer_states_map_to_steps() {
        let base = running(BatchingStatus::Processing);
        assert!(base.needs_transfer());
        assert_eq!(next_step(&base), Step::Stage);

        let cases = [
            (TransferState::NotStarted, Step::AwaitTransfer),
            (TransferState::Running, Step::AwaitTransfer),
            (TransferState::Succeeded, Step::FinishTransfer),
            (TransferState::Failed, Step::FailTransfer),
        ];
        for (state, expected) in cases {
            let observed = Observed {
                transfer: Some(state),
                ..base.clone()
            };
            assert_eq!(next_step(&observed), expected, "{state:?}");
        }
    }

    #[test]
    fn test_transfer_done_hands_off_to_cleanup() {
        for phase in [Phase::SnapshotBackupDone, Phase::SnapshotRestoreDone] {
            let observed = Observed {
                phase: Some(phase),
                ..fresh()
            };
            assert!(!observed.needs_admission());
            assert_eq!(next_step(&observed), Step::Cleanup);
        }
    }

    #[test]
    fn test_outcomes_are_settled() {
        for phase in [Phase::Completed, Phase::Failed, Phase::PartiallyFailed] {
            let observed = Observed {
                phase: Some(phase),
                ..fresh()
            };
            assert_eq!(next_step(&observed), Step::Settled);
            assert!(!next_step(&observed).continues());
        }
    }
}
