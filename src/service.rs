use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::ServiceConfig;
use crate::error::{QueueError, Result};
use crate::events::{spawn_event_logger, EventBus};
use crate::health::HealthMonitor;
use crate::queue::{JobStore, QueueManager, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::worker::{ExecutorRegistry, WorkerPool};

/// Wires the queue, worker pool, scheduler, health monitor and HTTP
/// transport together and owns their lifecycle.
pub struct Service {
    pub config: ServiceConfig,
    pub events: EventBus,
    pub queue: Arc<QueueManager>,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthMonitor>,
}

impl Service {
    /// Build all components and bring the worker pool up. Fails when a
    /// worker misses its readiness deadline.
    pub async fn start(config: ServiceConfig, registry: Arc<ExecutorRegistry>) -> Result<Self> {
        let events = EventBus::new(256);
        let store = JobStore::new(config.queue_max_size, config.max_job_attempts);
        let retry = RetryPolicy::new(config.retry_backoff_base, config.retry_jitter);
        let queue = Arc::new(QueueManager::new(store, events.clone(), retry));
        let pool = WorkerPool::start(
            config.worker_pool_size,
            config.worker_ready_timeout,
            registry,
        )
        .await?;
        let scheduler = Scheduler::new(Arc::clone(&queue), Arc::clone(&pool), config.poll_interval);
        let health = HealthMonitor::new(config.health_report_interval);

        Ok(Self {
            config,
            events,
            queue,
            pool,
            scheduler,
            health,
        })
    }

    /// Run until `shutdown` fires, then tear down in order: quiesce the
    /// scheduler, drain the worker pool, stop the transport.
    pub async fn run(self, shutdown: CancellationToken) -> Result<ShutdownOutcome> {
        spawn_event_logger(&self.events);
        self.health.observe(&self.events);
        let reporter_token = CancellationToken::new();
        Arc::clone(&self.health).run_reporter(
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            Arc::clone(&self.scheduler),
            reporter_token.clone(),
        );
        Arc::clone(&self.scheduler).run();

        let state = Arc::new(ApiState {
            queue: Arc::clone(&self.queue),
            pool: Arc::clone(&self.pool),
            scheduler: Arc::clone(&self.scheduler),
            health: Arc::clone(&self.health),
        });
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "HTTP API listening");
        let http_token = CancellationToken::new();
        let server = tokio::spawn(api::serve(listener, api::router(state), http_token.clone()));

        shutdown.cancelled().await;
        tracing::info!("Shutdown signal received");
        reporter_token.cancel();

        let mut coordinator = ShutdownCoordinator::new(self.config.shutdown_timeout);

        let scheduler = Arc::clone(&self.scheduler);
        coordinator.register("scheduler", async move {
            scheduler.pause();
            scheduler.wait_for_active_executions().await;
            scheduler.stop();
            Ok(())
        });

        let pool = Arc::clone(&self.pool);
        coordinator.register("worker-pool", async move {
            pool.shutdown().await;
            Ok(())
        });

        coordinator.register("http", async move {
            http_token.cancel();
            match server.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(QueueError::Io(err)),
                Err(err) => Err(QueueError::Internal(format!("http server task: {err}"))),
            }
        });

        Ok(coordinator.run().await)
    }
}
