//! Batching admission: bounds how many jobs of one kind transfer at once.
//!
//! Jobs over the bound wait in a queue ordered by creation time (ties broken
//! by name, then namespace) and are promoted oldest first as slots free up.
//! All accounting lives behind one mutex so concurrent admits and releases
//! cannot over-admit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::models::{BatchingStatus, JobRef};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    created: DateTime<Utc>,
    name: String,
    namespace: String,
}

impl QueueEntry {
    fn new(job: &JobRef, created: DateTime<Utc>) -> Self {
        Self {
            created,
            name: job.name.clone(),
            namespace: job.namespace.clone(),
        }
    }

    fn job(&self) -> JobRef {
        JobRef::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Default)]
struct Admission {
    processing: HashSet<JobRef>,
    queue: BTreeSet<QueueEntry>,
    queued: HashMap<JobRef, QueueEntry>,
}

impl Admission {
    fn enqueue(&mut self, job: &JobRef, created: DateTime<Utc>) {
        if self.queued.contains_key(job) {
            return;
        }
        let entry = QueueEntry::new(job, created);
        self.queue.insert(entry.clone());
        self.queued.insert(job.clone(), entry);
    }

    fn withdraw(&mut self, job: &JobRef) -> bool {
        match self.queued.remove(job) {
            Some(entry) => self.queue.remove(&entry),
            None => false,
        }
    }

    /// Promote queued jobs, oldest first, while slots are free.
    fn fill(&mut self, limit: usize) -> Vec<JobRef> {
        let mut promoted = Vec::new();
        while self.processing.len() < limit {
            let Some(entry) = self.queue.pop_first() else {
                break;
            };
            let job = entry.job();
            self.queued.remove(&job);
            self.processing.insert(job.clone());
            promoted.push(job);
        }
        promoted
    }
}

/// Point-in-time view of the admission state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchingSnapshot {
    pub limit: usize,
    pub processing: Vec<JobRef>,
    /// In promotion order.
    pub queued: Vec<JobRef>,
}

/// Admission controller for one job kind. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct BatchingController {
    limit: usize,
    inner: Arc<Mutex<Admission>>,
}

impl BatchingController {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new(Admission::default())),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Decide whether `job` may transfer now.
    ///
    /// `persisted` is the batching status already recorded on the job; a job
    /// recorded as `Processing` keeps its slot and one recorded as `Completed`
    /// is never admitted again. Calling this repeatedly is a no-op.
    pub async fn admit(
        &self,
        job: &JobRef,
        created: Option<DateTime<Utc>>,
        persisted: Option<BatchingStatus>,
    ) -> BatchingStatus {
        let mut state = self.inner.lock().await;

        if persisted == Some(BatchingStatus::Completed) {
            return BatchingStatus::Completed;
        }
        if state.processing.contains(job) {
            return BatchingStatus::Processing;
        }
        if persisted == Some(BatchingStatus::Processing) {
            state.withdraw(job);
            state.processing.insert(job.clone());
            return BatchingStatus::Processing;
        }

        state.enqueue(job, created.unwrap_or_else(Utc::now));
        let promoted = state.fill(self.limit);
        if !promoted.is_empty() {
            debug!(promoted = promoted.len(), "Promoted queued jobs on admit");
        }

        if state.processing.contains(job) {
            info!(job = %job, active = state.processing.len(), limit = self.limit, "Job admitted");
            BatchingStatus::Processing
        } else {
            debug!(job = %job, queued = state.queue.len(), "Job queued");
            BatchingStatus::Queued
        }
    }

    /// Free the slot held by `job` and promote waiting jobs.
    ///
    /// Releasing a queued job withdraws it from the queue; releasing an unknown
    /// job does nothing. Returns the jobs that were promoted.
    pub async fn release(&self, job: &JobRef) -> Vec<JobRef> {
        let mut state = self.inner.lock().await;
        if state.processing.remove(job) {
            let promoted = state.fill(self.limit);
            info!(job = %job, promoted = promoted.len(), "Released batching slot");
            promoted
        } else {
            if state.withdraw(job) {
                debug!(job = %job, "Withdrew queued job");
            }
            Vec::new()
        }
    }

    /// Rebuild accounting from persisted statuses, e.g. after a restart.
    /// Returns the queued jobs that could be promoted immediately.
    pub async fn seed<I>(&self, jobs: I) -> Vec<JobRef>
    where
        I: IntoIterator<Item = (JobRef, Option<DateTime<Utc>>, BatchingStatus)>,
    {
        let mut state = self.inner.lock().await;
        for (job, created, status) in jobs {
            match status {
                BatchingStatus::Processing => {
                    state.withdraw(&job);
                    state.processing.insert(job);
                }
                BatchingStatus::Queued if !state.processing.contains(&job) => {
                    state.enqueue(&job, created.unwrap_or_else(Utc::now));
                }
                _ => {}
            }
        }
        let promoted = state.fill(self.limit);
        info!(
            processing = state.processing.len(),
            queued = state.queue.len(),
            "Seeded batching state"
        );
        promoted
    }

    pub async fn snapshot(&self) -> BatchingSnapshot {
        let state = self.inner.lock().await;
        let mut processing: Vec<JobRef> = state.processing.iter().cloned().collect();
        processing.sort();
        BatchingSnapshot {
            limit: self.limit,
            processing,
            queued: state.queue.iter().map(QueueEntry::job).collect(),
        }
    }
}
