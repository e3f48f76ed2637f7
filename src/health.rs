use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, JobEventKind};
use crate::queue::{QueueManager, StoreStats};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::worker::{PoolStats, WorkerPool};

#[derive(Debug, Default)]
struct EventCounters {
    created: AtomicU64,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
}

impl EventCounters {
    fn record(&self, kind: JobEventKind) {
        let counter = match kind {
            JobEventKind::Created => &self.created,
            JobEventKind::Started => &self.started,
            JobEventKind::Completed => &self.completed,
            JobEventKind::Failed => &self.failed,
            JobEventKind::Retrying => &self.retried,
            JobEventKind::Dead => &self.dead,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EventCounts {
        EventCounts {
            created: self.created.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EventCounts {
    pub created: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub pid: u32,
    pub memory_rss_bytes: Option<u64>,
    pub events: EventCounts,
    pub queue: StoreStats,
    pub pool: PoolStats,
    pub scheduler: SchedulerStats,
}

/// Aggregates event-bus counters and subsystem snapshots into a single
/// status document, and logs a one-line summary per interval. Not on
/// the critical path: nothing here can affect job processing.
pub struct HealthMonitor {
    counters: Arc<EventCounters>,
    started_at: Instant,
    report_interval: Duration,
}

impl HealthMonitor {
    pub fn new(report_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            counters: Arc::new(EventCounters::default()),
            started_at: Instant::now(),
            report_interval,
        })
    }

    /// Subscribe to the bus and keep the counters current.
    pub fn observe(&self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => counters.record(event.kind),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Health monitor lagged, counts are approximate");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Periodic summary log line until the token is cancelled.
    pub fn run_reporter(
        self: Arc<Self>,
        queue: Arc<QueueManager>,
        pool: Arc<WorkerPool>,
        scheduler: Arc<Scheduler>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.report_interval);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let report = monitor.report(&queue, &pool, &scheduler).await;
                tracing::info!(
                    uptime_secs = report.uptime_secs,
                    jobs_total = report.queue.total,
                    completed = report.events.completed,
                    failed = report.events.failed,
                    dead = report.events.dead,
                    workers_busy = report.pool.busy,
                    in_flight = report.scheduler.in_flight,
                    "Health summary"
                );
            }
        })
    }

    pub async fn report(
        &self,
        queue: &QueueManager,
        pool: &WorkerPool,
        scheduler: &Scheduler,
    ) -> HealthReport {
        HealthReport {
            status: "ok",
            uptime_secs: self.started_at.elapsed().as_secs(),
            pid: std::process::id(),
            memory_rss_bytes: resident_memory_bytes(),
            events: self.counters.snapshot(),
            queue: queue.stats().await,
            pool: pool.stats(),
            scheduler: scheduler.stats().await,
        }
    }
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}
