use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{QueueError, Result};
use super::job::{Job, JobId, JobKind, JobStatus};

/// Ordering key for status buckets: FIFO by creation time, ties broken
/// by id so the order is total.
type BucketKey = (DateTime<Utc>, JobId);

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
    pub dead: usize,
    pub total: usize,
}

/// Authoritative in-memory mapping `id -> Job` with per-status buckets.
///
/// Every job is in exactly one bucket; a transition removes it from the
/// old bucket, mutates the record, and inserts it into the new bucket
/// under a single `&mut self`, so readers never observe a job in zero
/// or two buckets.
#[derive(Debug)]
pub struct JobStore {
    jobs: HashMap<JobId, Job>,
    buckets: HashMap<JobStatus, BTreeSet<BucketKey>>,
    max_jobs: usize,
    default_max_attempts: u32,
}

impl JobStore {
    pub fn new(max_jobs: usize, default_max_attempts: u32) -> Self {
        let buckets = JobStatus::ALL
            .iter()
            .map(|status| (*status, BTreeSet::new()))
            .collect();
        Self {
            jobs: HashMap::new(),
            buckets,
            max_jobs,
            default_max_attempts,
        }
    }

    /// Insert a new Pending job. Fails when the store is at capacity.
    pub fn create(
        &mut self,
        kind: JobKind,
        payload: serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<Job> {
        if self.jobs.len() >= self.max_jobs {
            return Err(QueueError::QueueFull(self.max_jobs));
        }
        let max_attempts = max_attempts.unwrap_or(self.default_max_attempts).max(1);
        let job = Job::new(kind, payload, max_attempts);
        self.bucket_mut(JobStatus::Pending)
            .insert((job.created_at, job.id));
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.jobs
            .get(&id)
            .map(|job| job.status == JobStatus::Running)
            .unwrap_or(false)
    }

    /// Move a job to `new_status`, applying `patch` to the record.
    /// Terminal jobs reject any further transition; other legality is
    /// the caller's responsibility.
    pub fn transition(
        &mut self,
        id: JobId,
        new_status: JobStatus,
        patch: impl FnOnce(&mut Job),
    ) -> Result<Job> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
        let old_status = job.status;
        if old_status.is_terminal() {
            return Err(QueueError::IllegalTransition {
                id,
                from: old_status,
                to: new_status,
            });
        }
        job.status = new_status;
        patch(job);
        let key = (job.created_at, job.id);
        let snapshot = job.clone();
        self.bucket_mut(old_status).remove(&key);
        self.bucket_mut(new_status).insert(key);
        Ok(snapshot)
    }

    /// Dispatch bookkeeping: consume an attempt and stamp the start.
    pub fn mark_started(&mut self, id: JobId) -> Result<Job> {
        self.transition(id, JobStatus::Running, |job| {
            job.attempts += 1;
            job.started_at = Some(Utc::now());
            job.retry_at = None;
        })
    }

    pub fn mark_completed(&mut self, id: JobId) -> Result<Job> {
        self.transition(id, JobStatus::Completed, |job| {
            job.finished_at = Some(Utc::now());
            job.retry_at = None;
        })
    }

    /// Record a failure. Decides Dead vs Failed by comparing attempts to
    /// the limit; a Failed job is expected to be moved on to Retrying by
    /// the caller before the store is observed again.
    pub fn mark_failed(&mut self, id: JobId, error: &str) -> Result<Job> {
        let job = self.jobs.get(&id).ok_or(QueueError::JobNotFound(id))?;
        if job.attempts >= job.max_attempts {
            self.transition(id, JobStatus::Dead, |job| {
                job.error = Some(error.to_string());
                job.finished_at = Some(Utc::now());
                job.retry_at = None;
            })
        } else {
            self.transition(id, JobStatus::Failed, |job| {
                job.error = Some(error.to_string());
            })
        }
    }

    pub fn mark_retrying(&mut self, id: JobId, retry_at: DateTime<Utc>) -> Result<Job> {
        self.transition(id, JobStatus::Retrying, |job| {
            job.retry_at = Some(retry_at);
        })
    }

    /// Jobs eligible for dispatch: all Pending jobs plus Retrying jobs
    /// whose `retry_at` has elapsed, FIFO by creation time.
    pub fn ready_for_execution(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut ready: Vec<&Job> = self
            .bucket(JobStatus::Pending)
            .iter()
            .filter_map(|(_, id)| self.jobs.get(id))
            .collect();
        ready.extend(
            self.bucket(JobStatus::Retrying)
                .iter()
                .filter_map(|(_, id)| self.jobs.get(id))
                .filter(|job| job.retry_at.map(|at| at <= now).unwrap_or(false)),
        );
        ready.sort_by_key(|job| (job.created_at, job.id));
        ready.into_iter().cloned().collect()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pending: self.bucket(JobStatus::Pending).len(),
            running: self.bucket(JobStatus::Running).len(),
            completed: self.bucket(JobStatus::Completed).len(),
            failed: self.bucket(JobStatus::Failed).len(),
            retrying: self.bucket(JobStatus::Retrying).len(),
            dead: self.bucket(JobStatus::Dead).len(),
            total: self.jobs.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    fn bucket(&self, status: JobStatus) -> &BTreeSet<BucketKey> {
        // All buckets are created up front in `new`.
        &self.buckets[&status]
    }

    fn bucket_mut(&mut self, status: JobStatus) -> &mut BTreeSet<BucketKey> {
        self.buckets
            .get_mut(&status)
            .expect("bucket exists for every status")
    }
}
