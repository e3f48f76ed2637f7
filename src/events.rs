use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::queue::job::{Job, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Started,
    Completed,
    Failed,
    Retrying,
    Dead,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Created => write!(f, "job:created"),
            JobEventKind::Started => write!(f, "job:started"),
            JobEventKind::Completed => write!(f, "job:completed"),
            JobEventKind::Failed => write!(f, "job:failed"),
            JobEventKind::Retrying => write!(f, "job:retrying"),
            JobEventKind::Dead => write!(f, "job:dead"),
        }
    }
}

/// One lifecycle event. Events for a single job arrive in state-machine
/// order; no ordering is promised across jobs.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job_id: JobId,
    pub attempts: u32,
    pub error: Option<String>,
    /// Only set on `Retrying`.
    pub retry_delay_ms: Option<u64>,
}

impl JobEvent {
    fn new(kind: JobEventKind, job: &Job) -> Self {
        Self {
            kind,
            job_id: job.id,
            attempts: job.attempts,
            error: None,
            retry_delay_ms: None,
        }
    }

    pub fn created(job: &Job) -> Self {
        Self::new(JobEventKind::Created, job)
    }

    pub fn started(job: &Job) -> Self {
        Self::new(JobEventKind::Started, job)
    }

    pub fn completed(job: &Job) -> Self {
        Self::new(JobEventKind::Completed, job)
    }

    pub fn failed(job: &Job) -> Self {
        Self {
            error: job.error.clone(),
            ..Self::new(JobEventKind::Failed, job)
        }
    }

    pub fn retrying(job: &Job, delay: Duration) -> Self {
        Self {
            error: job.error.clone(),
            retry_delay_ms: Some(delay.as_millis() as u64),
            ..Self::new(JobEventKind::Retrying, job)
        }
    }

    pub fn dead(job: &Job) -> Self {
        Self {
            error: job.error.clone(),
            ..Self::new(JobEventKind::Dead, job)
        }
    }
}

/// Broadcast fan-out of lifecycle events. Delivery is best-effort and
/// in-process: producers never block, and an observer that falls behind
/// loses the oldest events (the lag is surfaced on its receiver).
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish. Having no subscribers is not an error.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Mirror every event to the log at debug level.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => tracing::debug!(
                    event = %event.kind,
                    job_id = %event.job_id,
                    attempts = event.attempts,
                    error = event.error.as_deref(),
                    "Job event"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event logger lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
