use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{QueueError, Result};
use crate::events::{EventBus, JobEvent};
use super::job::{Job, JobId, JobKind, JobStatus};
use super::retry::RetryPolicy;
use super::store::{JobStore, StoreStats};

/// Policy layer above the store: enforces the state machine, computes
/// retry schedules, and is the only component that emits lifecycle
/// events.
pub struct QueueManager {
    store: RwLock<JobStore>,
    events: EventBus,
    retry: RetryPolicy,
}

impl QueueManager {
    pub fn new(store: JobStore, events: EventBus, retry: RetryPolicy) -> Self {
        Self {
            store: RwLock::new(store),
            events,
            retry,
        }
    }

    /// Accept a new job. Propagates `QueueFull` when the store is at
    /// capacity.
    pub async fn create_job(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<Job> {
        let job = self.store.write().await.create(kind, payload, max_attempts)?;
        tracing::info!(job_id = %job.id, kind = %job.kind, "Job accepted");
        self.events.publish(JobEvent::created(&job));
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        self.store.read().await.get(id).cloned()
    }

    /// Move a job into Running, consuming an attempt. Rejects jobs that
    /// are already running.
    pub async fn start_job(&self, id: JobId) -> Result<Job> {
        let job = {
            let mut store = self.store.write().await;
            if store.is_running(id) {
                return Err(QueueError::AlreadyRunning(id));
            }
            store.mark_started(id)?
        };
        tracing::debug!(job_id = %id, attempt = job.attempts, "Job started");
        self.events.publish(JobEvent::started(&job));
        Ok(job)
    }

    pub async fn complete_job(&self, id: JobId) -> Result<Job> {
        let job = self.store.write().await.mark_completed(id)?;
        tracing::info!(job_id = %id, attempts = job.attempts, "Job completed");
        self.events.publish(JobEvent::completed(&job));
        Ok(job)
    }

    /// Record a failed attempt. Jobs with remaining attempts are
    /// scheduled for retry with exponential backoff; exhausted jobs are
    /// parked Dead. The two branches are mutually exclusive, and the
    /// transient Failed state is never observable: both store calls
    /// happen under one write lock.
    ///
    /// Emits `failed` first, then `retrying` or `dead` — observers may
    /// rely on that order.
    pub async fn fail_job(&self, id: JobId, error: &str) -> Result<Job> {
        let (job, delay) = {
            let mut store = self.store.write().await;
            let failed = store.mark_failed(id, error)?;
            if failed.status == JobStatus::Dead {
                (failed, None)
            } else {
                let delay = self.retry.next_delay(failed.attempts);
                let retry_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                (store.mark_retrying(id, retry_at)?, Some(delay))
            }
        };
        self.events.publish(JobEvent::failed(&job));
        match delay {
            Some(delay) => {
                tracing::warn!(
                    job_id = %id,
                    attempt = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error,
                    "Job failed, retry scheduled"
                );
                self.events.publish(JobEvent::retrying(&job, delay));
            }
            None => {
                tracing::error!(job_id = %id, attempts = job.attempts, error, "Job dead");
                self.events.publish(JobEvent::dead(&job));
            }
        }
        Ok(job)
    }

    /// Snapshot of jobs currently eligible for dispatch, FIFO by
    /// creation time.
    pub async fn ready_for_execution(&self) -> Vec<Job> {
        self.store.read().await.ready_for_execution(Utc::now())
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.read().await.stats()
    }
}
