//! Optimistic-concurrency writes of job objects.
//!
//! Every write re-reads the job, applies a mutation to the fresh copy and
//! writes it back with the version it read. A conflict repeats the cycle, so
//! the mutation always sees current state and monotonicity checks inside it
//! hold against what is actually stored.

use tracing::debug;

use super::error::ReconcileError;
use super::job::MoverJob;
use super::models::{JobRef, JobStatus, ObjectMeta};
use super::store::{ResourceStore, WriteChannel, get_opt};

/// Result of a patch: the job as stored afterwards, and whether a write
/// happened.
#[derive(Debug, Clone)]
pub struct Patched<J> {
    pub job: J,
    pub changed: bool,
}

/// Load a job. `None` if it no longer exists.
pub async fn load<J: MoverJob>(
    store: &dyn ResourceStore,
    key: &JobRef,
) -> Result<Option<J>, ReconcileError> {
    match get_opt(store, &J::KIND, Some(&key.namespace), &key.name).await? {
        Some(obj) => J::from_object(obj).map(Some),
        None => Ok(None),
    }
}

/// Apply `mutate` to the job's status and write it through the status
/// channel. `mutate` returns whether it changed anything; nothing is written
/// when it returns `false`. Returns `None` if the job is gone.
pub async fn patch_status<J, F>(
    store: &dyn ResourceStore,
    key: &JobRef,
    attempts: u32,
    mut mutate: F,
) -> Result<Option<Patched<J>>, ReconcileError>
where
    J: MoverJob,
    F: FnMut(&mut JobStatus) -> bool + Send,
{
    patch(store, key, attempts, WriteChannel::Status, |job: &mut J| {
        mutate(job.status_mut())
    })
    .await
}

/// Like [`patch_status`] for metadata (labels and finalizers).
pub async fn patch_metadata<J, F>(
    store: &dyn ResourceStore,
    key: &JobRef,
    attempts: u32,
    mut mutate: F,
) -> Result<Option<Patched<J>>, ReconcileError>
where
    J: MoverJob,
    F: FnMut(&mut ObjectMeta) -> bool + Send,
{
    patch(store, key, attempts, WriteChannel::Spec, |job: &mut J| {
        mutate(job.metadata_mut())
    })
    .await
}

async fn patch<J, F>(
    store: &dyn ResourceStore,
    key: &JobRef,
    attempts: u32,
    channel: WriteChannel,
    mut mutate: F,
) -> Result<Option<Patched<J>>, ReconcileError>
where
    J: MoverJob,
    F: FnMut(&mut J) -> bool + Send,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let Some(mut job) = load::<J>(store, key).await? else {
            return Ok(None);
        };
        if !mutate(&mut job) {
            return Ok(Some(Patched { job, changed: false }));
        }
        let obj = job.to_object()?;
        let written = match channel {
            WriteChannel::Spec => store.update(obj).await,
            WriteChannel::Status => store.update_status(obj).await,
        };
        match written {
            Ok(stored) => {
                return Ok(Some(Patched {
                    job: J::from_object(stored)?,
                    changed: true,
                }));
            }
            Err(e) if e.is_conflict() => {
                debug!(kind = J::KIND.kind, job = %key, attempt, "Write conflict, re-reading");
            }
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Err(ReconcileError::ConflictRetriesExhausted(
        format!("{} {key}", J::KIND.kind),
        attempts,
    ))
}
