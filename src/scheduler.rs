use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::job::{Job, JobId};
use crate::queue::QueueManager;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStats {
    pub in_flight: usize,
    pub paused: bool,
    pub ticks: u64,
}

/// Periodic dispatcher: turns the ready set into worker-pool executions,
/// at most one in flight per job id.
///
/// The poll loop never waits on an execution; each dispatch runs on its
/// own task and reports its outcome back through the queue manager. The
/// in-flight set keeps a job from being dispatched again while an
/// earlier dispatch is still unresolved, even if consecutive polls both
/// return it.
pub struct Scheduler {
    queue: Arc<QueueManager>,
    pool: Arc<WorkerPool>,
    poll_interval: Duration,
    paused: AtomicBool,
    stopped: CancellationToken,
    in_flight: Mutex<HashSet<JobId>>,
    active: watch::Sender<usize>,
    ticks: AtomicU64,
}

impl Scheduler {
    pub fn new(
        queue: Arc<QueueManager>,
        pool: Arc<WorkerPool>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (active, _) = watch::channel(0);
        Arc::new(Self {
            queue,
            pool,
            poll_interval,
            paused: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            in_flight: Mutex::new(HashSet::new()),
            active,
            ticks: AtomicU64::new(0),
        })
    }

    /// Spawn the poll loop.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.stopped.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if self.paused.load(Ordering::SeqCst) {
                    continue;
                }
                Arc::clone(&self).tick().await;
            }
            tracing::info!("Scheduler stopped");
        })
    }

    async fn tick(self: Arc<Self>) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let ready = self.queue.ready_for_execution().await;
        for job in ready {
            let id = job.id;
            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(id) {
                    continue;
                }
                // send_replace updates even with no receiver subscribed.
                self.active.send_replace(in_flight.len());
            }
            let job = match self.queue.start_job(id).await {
                Ok(job) => job,
                Err(err) => {
                    tracing::warn!(job_id = %id, error = %err, "Dispatch aborted");
                    self.clear_in_flight(id).await;
                    continue;
                }
            };
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.dispatch(job).await;
            });
        }
    }

    /// Hand one job to the pool and apply the outcome. Errors never
    /// escape a dispatch; they are recorded through `fail_job`.
    async fn dispatch(self: Arc<Self>, job: Job) {
        let id = job.id;
        let outcome = self.pool.execute(job).await;
        let recorded = match outcome {
            Ok(_result) => self.queue.complete_job(id).await,
            Err(err) => self.queue.fail_job(id, &err.to_string()).await,
        };
        if let Err(err) = recorded {
            tracing::error!(job_id = %id, error = %err, "Failed to record job outcome");
        }
        self.clear_in_flight(id).await;
    }

    async fn clear_in_flight(&self, id: JobId) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(&id);
        self.active.send_replace(in_flight.len());
    }

    /// Stop polling. In-flight executions continue. Idempotent.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Scheduler paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!("Scheduler resumed");
        }
    }

    /// Permanently halt the poll loop. Idempotent.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    /// Block until the in-flight set is empty.
    pub async fn wait_for_active_executions(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            in_flight: self.in_flight.lock().await.len(),
            paused: self.paused.load(Ordering::SeqCst),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}
