//! Level-triggered work queue driving a [`Reconciler`] for one job kind.
//!
//! Keys enter the queue from store watch events (job events directly, staged
//! resource events through the owner label), from periodic resyncs and from
//! requeue hints. A key is never reconciled by two workers at once: events for
//! a key already in flight mark it dirty and it runs again afterwards.
//! Each key holds at most one scheduled requeue; a later deadline never
//! replaces an earlier one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::ReconcileError;
use super::job::{MoverJob, OWNER_NAMESPACE_LABEL};
use super::models::{BatchingStatus, JobRef, Phase};
use super::reconciler::{Action, Reconciler};
use super::store::{ResourceStore, WatchEvent};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    pub resync_interval: Duration,
    pub error_backoff: Duration,
    pub max_error_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(1),
            max_error_backoff: Duration::from_secs(60),
        }
    }
}

pub struct Controller<J: MoverJob> {
    store: Arc<dyn ResourceStore>,
    reconciler: Reconciler<J>,
    settings: ControllerSettings,
}

struct Queue {
    tx: mpsc::UnboundedSender<JobRef>,
    timer_tx: mpsc::UnboundedSender<(JobRef, Instant)>,
    pending: HashSet<JobRef>,
    in_flight: HashSet<JobRef>,
    dirty: HashSet<JobRef>,
    failures: HashMap<JobRef, u32>,
    scheduled: HashMap<JobRef, Instant>,
}

impl Queue {
    fn push(&mut self, key: JobRef) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
        } else if self.pending.insert(key.clone()) {
            let _ = self.tx.send(key);
        }
    }

    /// Schedule `key` after `delay` unless it is already due no later than that.
    fn push_after(&mut self, key: JobRef, delay: Duration, shutdown: &CancellationToken) {
        let deadline = Instant::now() + delay;
        if self.scheduled.get(&key).is_some_and(|due| *due <= deadline) {
            return;
        }
        self.scheduled.insert(key.clone(), deadline);

        let tx = self.timer_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = tx.send((key, deadline));
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// A timer fired. Only the key's current deadline is honoured.
    fn fire(&mut self, key: JobRef, deadline: Instant) {
        if self.scheduled.get(&key) != Some(&deadline) {
            return;
        }
        self.scheduled.remove(&key);
        self.push(key);
    }

    fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }
}

impl<J: MoverJob> Controller<J> {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        reconciler: Reconciler<J>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            reconciler,
            settings,
        }
    }

    /// Run until `shutdown` is cancelled. In-flight passes finish first.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ReconcileError> {
        let kind = J::KIND.kind;
        let mut events = self.store.watch();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut queue = Queue {
            tx,
            timer_tx,
            pending: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            scheduled: HashMap::new(),
        };
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut workers: JoinSet<(JobRef, Result<Action, ReconcileError>)> = JoinSet::new();

        for key in self.seed().await? {
            queue.push(key);
        }
        info!(kind, workers = self.settings.workers, "Controller started");

        let mut resync = tokio::time::interval(self.settings.resync_interval);
        resync.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(key) = job_for::<J>(&event) {
                            queue.push(key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(kind, missed, "Watch lagged, relisting");
                        self.enqueue_all(&mut queue).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(kind, "Watch closed, stopping controller");
                        break;
                    }
                },

                Some(key) = rx.recv() => {
                    queue.pending.remove(&key);
                    if queue.in_flight.contains(&key) {
                        queue.dirty.insert(key);
                        continue;
                    }
                    queue.in_flight.insert(key.clone());
                    let reconciler = self.reconciler.clone();
                    let semaphore = semaphore.clone();
                    workers.spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return (key, Ok(Action::default()));
                        };
                        let result = reconciler.reconcile(&key).await;
                        (key, result)
                    });
                }

                Some((key, deadline)) = timer_rx.recv() => queue.fire(key, deadline),

                _ = resync.tick() => {
                    debug!(kind, scheduled = queue.scheduled_len(), "Periodic resync");
                    self.enqueue_all(&mut queue).await;
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok((key, result)) => self.finish(&mut queue, key, result, &shutdown),
                        Err(e) => error!(kind, error = %e, "Reconcile task panicked"),
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(kind, error = %e, "Reconcile task panicked during shutdown");
            }
        }
        info!(kind, "Controller stopped");
        Ok(())
    }

    fn finish(
        &self,
        queue: &mut Queue,
        key: JobRef,
        result: Result<Action, ReconcileError>,
        shutdown: &CancellationToken,
    ) {
        let kind = J::KIND.kind;
        queue.in_flight.remove(&key);

        match result {
            Ok(action) => {
                queue.failures.remove(&key);
                for promoted in action.promoted {
                    queue.push(promoted);
                }
                if let Some(delay) = action.requeue_after {
                    queue.push_after(key.clone(), delay, shutdown);
                }
            }
            Err(e) => {
                let failures = queue.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                let delay = backoff(
                    self.settings.error_backoff,
                    self.settings.max_error_backoff,
                    *failures,
                );
                warn!(kind, job = %key, error = %e, attempt = *failures, ?delay, "Reconcile failed, backing off");
                queue.push_after(key.clone(), delay, shutdown);
            }
        }

        if queue.dirty.remove(&key) {
            queue.push(key);
        }
    }

    /// List jobs of this kind, rebuild batching state and return every key.
    async fn seed(&self) -> Result<Vec<JobRef>, ReconcileError> {
        let objects = self.store.list(&J::KIND, None).await?;
        let mut keys = Vec::with_capacity(objects.len());
        let mut admitted = Vec::new();
        for obj in objects {
            let job = match J::from_object(obj) {
                Ok(job) => job,
                Err(e) => {
                    warn!(kind = J::KIND.kind, error = %e, "Skipping malformed job");
                    continue;
                }
            };
            let status = job.status();
            if status.phase == Some(Phase::InProgress) {
                if let Some(batching @ (BatchingStatus::Queued | BatchingStatus::Processing)) =
                    status.batching_status
                {
                    admitted.push((job.job_ref(), job.metadata().creation_timestamp, batching));
                }
            }
            keys.push(job.job_ref());
        }
        let promoted = self.reconciler.batching().seed(admitted).await;
        debug!(kind = J::KIND.kind, jobs = keys.len(), promoted = promoted.len(), "Seeded");
        Ok(keys)
    }

    async fn enqueue_all(&self, queue: &mut Queue) {
        match self.store.list(&J::KIND, None).await {
            Ok(objects) => {
                for obj in objects {
                    queue.push(obj.job_ref());
                }
            }
            Err(e) => warn!(kind = J::KIND.kind, error = %e, "Relist failed"),
        }
    }
}

/// The job a watch event concerns: the job itself, or the owner of a staged
/// resource as named by its owner labels.
fn job_for<J: MoverJob>(event: &WatchEvent) -> Option<JobRef> {
    let obj = event.object();
    if obj.kind == J::KIND.kind {
        return Some(obj.job_ref());
    }
    let owner = obj.label(J::OWNER_LABEL)?;
    let namespace = obj.label(OWNER_NAMESPACE_LABEL)?;
    Some(JobRef::new(namespace, owner))
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::BACKUP_OWNER_LABEL;
    use crate::core::models::{BackupJob, StoredObject};

    fn queue() -> (
        Queue,
        mpsc::UnboundedReceiver<JobRef>,
        mpsc::UnboundedReceiver<(JobRef, Instant)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let queue = Queue {
            tx,
            timer_tx,
            pending: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            scheduled: HashMap::new(),
        };
        (queue, rx, timer_rx)
    }

    #[tokio::test]
    async fn test_later_requeue_keeps_earlier_deadline() {
        let (mut queue, _rx, _timers) = queue();
        let shutdown = CancellationToken::new();
        let key = JobRef::new("apps", "b1");

        queue.push_after(key.clone(), Duration::from_millis(50), &shutdown);
        let first = queue.scheduled[&key];
        queue.push_after(key.clone(), Duration::from_secs(5), &shutdown);
        assert_eq!(queue.scheduled[&key], first);

        queue.push_after(key.clone(), Duration::from_millis(1), &shutdown);
        assert!(queue.scheduled[&key] < first);
        assert_eq!(queue.scheduled_len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_replaced_timer_is_ignored() {
        let (mut queue, mut rx, mut timers) = queue();
        let shutdown = CancellationToken::new();
        let key = JobRef::new("apps", "b1");

        queue.push_after(key.clone(), Duration::from_millis(40), &shutdown);
        queue.push_after(key.clone(), Duration::from_millis(5), &shutdown);

        let (fired, deadline) = timers.recv().await.unwrap();
        queue.fire(fired, deadline);
        assert_eq!(rx.recv().await.unwrap(), key);
        assert_eq!(queue.scheduled_len(), 0);

        let (fired, deadline) = timers.recv().await.unwrap();
        queue.fire(fired, deadline);
        assert!(rx.try_recv().is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_fired_key_in_flight_is_marked_dirty() {
        let (mut queue, mut rx, mut timers) = queue();
        let shutdown = CancellationToken::new();
        let key = JobRef::new("apps", "b1");
        queue.in_flight.insert(key.clone());

        queue.push_after(key.clone(), Duration::from_millis(1), &shutdown);
        let (fired, deadline) = timers.recv().await.unwrap();
        queue.fire(fired, deadline);
        assert!(queue.dirty.contains(&key));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_staged_resource_maps_to_owner_in_its_namespace() {
        let pod = StoredObject::new("Pod", Some("adp"), "b1-pod")
            .with_label(BACKUP_OWNER_LABEL, "b1")
            .with_label(OWNER_NAMESPACE_LABEL, "team2");
        assert_eq!(
            job_for::<BackupJob>(&WatchEvent::Applied(pod)),
            Some(JobRef::new("team2", "b1"))
        );

        let unlabelled = StoredObject::new("Pod", Some("adp"), "b1-pod").with_label(BACKUP_OWNER_LABEL, "b1");
        assert_eq!(job_for::<BackupJob>(&WatchEvent::Deleted(unlabelled)), None);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(backoff(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff(base, max, 4), Duration::from_secs(8));
        assert_eq!(backoff(base, max, 5), max);
        assert_eq!(backoff(base, max, 100), max);
    }
}
