use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::error::{QueueError, Result};
use crate::queue::job::{Job, JobId};
use super::executor::ExecutorRegistry;

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
}

/// Pool -> worker.
enum WorkerCommand {
    Execute(Box<Job>),
    Terminate,
}

/// Worker -> pool.
enum WorkerMessage {
    Ready {
        worker_id: WorkerId,
    },
    Success {
        worker_id: WorkerId,
        job_id: JobId,
        result: Value,
    },
    Failure {
        worker_id: WorkerId,
        job_id: JobId,
        error: String,
    },
    /// Uncaught error in the worker context; the in-flight job is
    /// treated as crashed and the worker is replaced.
    Crashed {
        worker_id: WorkerId,
        error: String,
    },
    Terminated {
        worker_id: WorkerId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Starting,
    Ready,
    Busy,
    Draining,
    Terminated,
}

struct WorkerHandle {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    phase: WorkerPhase,
}

struct PendingExec {
    job: Job,
    reply: oneshot::Sender<Result<Value>>,
}

struct InFlight {
    job_id: JobId,
    reply: oneshot::Sender<Result<Value>>,
}

enum PoolRequest {
    Execute {
        job: Job,
        reply: oneshot::Sender<Result<Value>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Default)]
struct SharedStats {
    total: AtomicUsize,
    available: AtomicUsize,
    busy: AtomicUsize,
}

/// Fixed-size pool of isolated worker tasks.
///
/// All pool state lives inside a supervisor task; the handle talks to
/// it exclusively through messages, so executor failures (including
/// panics in type-specific code) can never corrupt pool bookkeeping or
/// the callers. Assignment is FIFO over waiting `execute` calls and
/// FIFO over free workers; a released worker rejoins at the tail.
pub struct WorkerPool {
    req_tx: mpsc::Sender<PoolRequest>,
    stats: Arc<SharedStats>,
}

impl WorkerPool {
    /// Spawn the supervisor and `pool_size` workers. Each worker must
    /// signal readiness within `ready_timeout` before it counts toward
    /// the pool; a late worker fails startup with `WorkerInitFailed`.
    pub async fn start(
        pool_size: usize,
        ready_timeout: Duration,
        registry: Arc<ExecutorRegistry>,
    ) -> Result<Arc<Self>> {
        let (req_tx, req_rx) = mpsc::channel(1024);
        let (init_tx, init_rx) = oneshot::channel();
        let stats = Arc::new(SharedStats::default());

        tokio::spawn(supervisor_main(
            pool_size,
            ready_timeout,
            registry,
            req_rx,
            Arc::clone(&stats),
            init_tx,
        ));

        init_rx
            .await
            .map_err(|_| QueueError::Internal("worker pool supervisor died during init".into()))??;

        Ok(Arc::new(Self { req_tx, stats }))
    }

    /// Run `job` on the next free worker. Blocks until a worker is
    /// available and the worker reports an outcome.
    pub async fn execute(&self, job: Job) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(PoolRequest::Execute {
                job,
                reply: reply_tx,
            })
            .await
            .map_err(|_| QueueError::PoolShuttingDown)?;
        reply_rx.await.map_err(|_| QueueError::PoolShuttingDown)?
    }

    /// Drain and stop: new and queued-but-unassigned `execute` calls are
    /// rejected, busy workers finish their current job, then all workers
    /// are terminated. Returns once the pool is fully stopped.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .req_tx
            .send(PoolRequest::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.stats.total.load(Ordering::Relaxed),
            available: self.stats.available.load(Ordering::Relaxed),
            busy: self.stats.busy.load(Ordering::Relaxed),
        }
    }
}

/// Supervisor-owned pool state. The channel receivers and the worker
/// `JoinSet` stay as locals in `supervisor_main` so `select!` arms
/// borrow disjoint data.
struct PoolState {
    registry: Arc<ExecutorRegistry>,
    msg_tx: mpsc::Sender<WorkerMessage>,
    workers: HashMap<WorkerId, WorkerHandle>,
    idle: VecDeque<WorkerId>,
    waiting: VecDeque<PendingExec>,
    in_flight: HashMap<WorkerId, InFlight>,
    next_worker_id: WorkerId,
    draining: bool,
    shutdown_done: Vec<oneshot::Sender<()>>,
    stats: Arc<SharedStats>,
}

async fn supervisor_main(
    pool_size: usize,
    ready_timeout: Duration,
    registry: Arc<ExecutorRegistry>,
    mut req_rx: mpsc::Receiver<PoolRequest>,
    stats: Arc<SharedStats>,
    init_tx: oneshot::Sender<Result<()>>,
) {
    let (msg_tx, mut msg_rx) = mpsc::channel(pool_size.max(1) * 4);
    let mut tasks: JoinSet<WorkerId> = JoinSet::new();
    let mut state = PoolState {
        registry,
        msg_tx,
        workers: HashMap::new(),
        idle: VecDeque::new(),
        waiting: VecDeque::new(),
        in_flight: HashMap::new(),
        next_worker_id: 1,
        draining: false,
        shutdown_done: Vec::new(),
        stats,
    };

    for _ in 0..pool_size {
        state.spawn_worker(&mut tasks);
    }

    // Init handshake: every worker must report ready before the pool
    // accepts work.
    let deadline = tokio::time::sleep(ready_timeout);
    tokio::pin!(deadline);
    let mut ready = 0usize;
    while ready < pool_size {
        tokio::select! {
            _ = &mut deadline => {
                let late = state
                    .workers
                    .iter()
                    .find(|(_, handle)| handle.phase == WorkerPhase::Starting)
                    .map(|(id, _)| *id)
                    .unwrap_or_default();
                tracing::error!(worker_id = late, "Worker failed to signal readiness");
                let _ = init_tx.send(Err(QueueError::WorkerInitFailed(late)));
                return;
            }
            Some(msg) = msg_rx.recv() => {
                if let WorkerMessage::Ready { worker_id } = msg {
                    state.worker_ready(worker_id);
                    ready += 1;
                }
            }
        }
    }
    tracing::info!(pool_size, "Worker pool ready");
    let _ = init_tx.send(Ok(()));

    let mut requests_open = true;
    loop {
        tokio::select! {
            req = req_rx.recv(), if requests_open => match req {
                Some(PoolRequest::Execute { job, reply }) => state.handle_execute(job, reply),
                Some(PoolRequest::Shutdown { done }) => state.begin_drain(Some(done)),
                // All pool handles dropped: drain and stop.
                None => {
                    requests_open = false;
                    state.begin_drain(None);
                }
            },
            Some(msg) = msg_rx.recv() => state.handle_worker_message(msg, &mut tasks),
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                state.handle_worker_exit(joined, &mut tasks);
            }
        }

        if state.draining && state.in_flight.is_empty() && tasks.is_empty() {
            break;
        }
    }

    state.publish_stats();
    for done in state.shutdown_done.drain(..) {
        let _ = done.send(());
    }
    tracing::info!("Worker pool stopped");
}

impl PoolState {
    fn spawn_worker(&mut self, tasks: &mut JoinSet<WorkerId>) -> WorkerId {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        tasks.spawn(worker_main(
            worker_id,
            cmd_rx,
            self.msg_tx.clone(),
            Arc::clone(&self.registry),
        ));
        self.workers.insert(
            worker_id,
            WorkerHandle {
                cmd_tx,
                phase: WorkerPhase::Starting,
            },
        );
        worker_id
    }

    fn handle_execute(&mut self, job: Job, reply: oneshot::Sender<Result<Value>>) {
        if self.draining {
            let _ = reply.send(Err(QueueError::PoolShuttingDown));
            return;
        }
        self.waiting.push_back(PendingExec { job, reply });
        self.assign();
    }

    /// Pair waiting calls with idle workers, both FIFO.
    fn assign(&mut self) {
        while !self.waiting.is_empty() {
            let Some(worker_id) = self.idle.pop_front() else {
                break;
            };
            // Crashed workers may leave stale ids behind.
            if !self.workers.contains_key(&worker_id) {
                continue;
            }
            let PendingExec { job, reply } = self
                .waiting
                .pop_front()
                .expect("checked non-empty above");
            let job_id = job.id;
            let handle = self
                .workers
                .get_mut(&worker_id)
                .expect("checked contains_key above");
            match handle.cmd_tx.try_send(WorkerCommand::Execute(Box::new(job))) {
                Ok(()) => {
                    handle.phase = WorkerPhase::Busy;
                    self.in_flight.insert(worker_id, InFlight { job_id, reply });
                }
                Err(err) => {
                    // The worker's channel is gone or wedged; requeue the
                    // job at the front and retire the worker. Its task
                    // exit is reaped separately.
                    if let mpsc::error::TrySendError::Closed(WorkerCommand::Execute(job))
                    | mpsc::error::TrySendError::Full(WorkerCommand::Execute(job)) = err
                    {
                        self.waiting.push_front(PendingExec { job: *job, reply });
                    }
                    self.workers.remove(&worker_id);
                }
            }
        }
        self.publish_stats();
    }

    fn handle_worker_message(&mut self, msg: WorkerMessage, tasks: &mut JoinSet<WorkerId>) {
        match msg {
            WorkerMessage::Ready { worker_id } => {
                if self.draining {
                    self.retire_worker(worker_id);
                } else {
                    self.worker_ready(worker_id);
                }
            }
            WorkerMessage::Success {
                worker_id, job_id, result,
            } => {
                tracing::debug!(worker_id, job_id = %job_id, "Worker reported success");
                self.finish(worker_id, Ok(result));
            }
            WorkerMessage::Failure {
                worker_id, job_id, error,
            } => {
                tracing::debug!(worker_id, job_id = %job_id, error = %error, "Worker reported failure");
                self.finish(worker_id, Err(QueueError::Executor(error)));
            }
            WorkerMessage::Crashed { worker_id, error } => {
                tracing::warn!(worker_id, error = %error, "Worker crashed");
                if let Some(in_flight) = self.in_flight.remove(&worker_id) {
                    let _ = in_flight.reply.send(Err(QueueError::WorkerCrashed {
                        worker_id,
                        message: error,
                    }));
                }
                self.retire_worker(worker_id);
                self.replace_worker(tasks);
                self.publish_stats();
            }
            WorkerMessage::Terminated { worker_id } => {
                if let Some(handle) = self.workers.get_mut(&worker_id) {
                    handle.phase = WorkerPhase::Terminated;
                }
            }
        }
    }

    fn worker_ready(&mut self, worker_id: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&worker_id) {
            handle.phase = WorkerPhase::Ready;
            self.idle.push_back(worker_id);
            tracing::debug!(worker_id, "Worker ready");
        }
        self.assign();
    }

    /// Settle the in-flight call for `worker_id` and put the worker back
    /// at the tail of the idle queue (or terminate it while draining).
    fn finish(&mut self, worker_id: WorkerId, outcome: Result<Value>) {
        if let Some(in_flight) = self.in_flight.remove(&worker_id) {
            let _ = in_flight.reply.send(outcome);
        }
        if self.draining {
            self.retire_worker(worker_id);
            self.publish_stats();
        } else if let Some(handle) = self.workers.get_mut(&worker_id) {
            handle.phase = WorkerPhase::Ready;
            self.idle.push_back(worker_id);
            self.assign();
        }
    }

    /// Tell a worker to stop and drop it from scheduling.
    fn retire_worker(&mut self, worker_id: WorkerId) {
        self.idle.retain(|id| *id != worker_id);
        if let Some(handle) = self.workers.get_mut(&worker_id) {
            handle.phase = WorkerPhase::Draining;
            let _ = handle.cmd_tx.try_send(WorkerCommand::Terminate);
        }
    }

    fn replace_worker(&mut self, tasks: &mut JoinSet<WorkerId>) {
        if self.draining {
            return;
        }
        let worker_id = self.spawn_worker(tasks);
        tracing::info!(worker_id, "Replacement worker starting");
    }

    fn handle_worker_exit(
        &mut self,
        joined: std::result::Result<WorkerId, tokio::task::JoinError>,
        tasks: &mut JoinSet<WorkerId>,
    ) {
        match joined {
            Ok(worker_id) => {
                let expected = self
                    .workers
                    .get(&worker_id)
                    .map(|handle| {
                        matches!(handle.phase, WorkerPhase::Draining | WorkerPhase::Terminated)
                    })
                    .unwrap_or(true);
                self.workers.remove(&worker_id);
                self.idle.retain(|id| *id != worker_id);
                if !expected {
                    tracing::warn!(worker_id, "Worker exited unexpectedly");
                    if let Some(in_flight) = self.in_flight.remove(&worker_id) {
                        let _ = in_flight
                            .reply
                            .send(Err(QueueError::WorkerExited(worker_id)));
                    }
                    self.replace_worker(tasks);
                }
                self.publish_stats();
            }
            Err(join_err) => {
                // The worker task itself died; the id is unknown, so
                // reap every worker whose command channel has closed.
                tracing::error!(error = %join_err, "Worker task aborted");
                let dead: Vec<WorkerId> = self
                    .workers
                    .iter()
                    .filter(|(_, handle)| {
                        handle.cmd_tx.is_closed() && handle.phase != WorkerPhase::Terminated
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for worker_id in dead {
                    self.workers.remove(&worker_id);
                    self.idle.retain(|id| *id != worker_id);
                    if let Some(in_flight) = self.in_flight.remove(&worker_id) {
                        let _ = in_flight
                            .reply
                            .send(Err(QueueError::WorkerExited(worker_id)));
                    }
                    self.replace_worker(tasks);
                }
                self.publish_stats();
            }
        }
    }

    fn begin_drain(&mut self, done: Option<oneshot::Sender<()>>) {
        if let Some(done) = done {
            self.shutdown_done.push(done);
        }
        if self.draining {
            tracing::debug!("Worker pool already draining");
            return;
        }
        tracing::info!(
            busy = self.in_flight.len(),
            rejected = self.waiting.len(),
            "Worker pool draining"
        );
        self.draining = true;
        for pending in self.waiting.drain(..) {
            let _ = pending.reply.send(Err(QueueError::PoolShuttingDown));
        }
        let idle: Vec<WorkerId> = self.idle.drain(..).collect();
        for worker_id in idle {
            self.retire_worker(worker_id);
        }
        self.publish_stats();
    }

    fn publish_stats(&self) {
        let total = self
            .workers
            .values()
            .filter(|handle| {
                matches!(handle.phase, WorkerPhase::Ready | WorkerPhase::Busy)
            })
            .count();
        self.stats.total.store(total, Ordering::Relaxed);
        self.stats.available.store(self.idle.len(), Ordering::Relaxed);
        self.stats.busy.store(self.in_flight.len(), Ordering::Relaxed);
    }
}

/// One worker: receives commands, runs the executor for each job on a
/// sub-task so a panic in type-specific code is contained here, and
/// reports outcomes back to the supervisor.
async fn worker_main(
    worker_id: WorkerId,
    mut cmd_rx: mpsc::Receiver<WorkerCommand>,
    msg_tx: mpsc::Sender<WorkerMessage>,
    registry: Arc<ExecutorRegistry>,
) -> WorkerId {
    if msg_tx
        .send(WorkerMessage::Ready { worker_id })
        .await
        .is_err()
    {
        return worker_id;
    }

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            WorkerCommand::Execute(job) => {
                let job_id = job.id;
                let registry = Arc::clone(&registry);
                let execution = tokio::spawn(async move { run_executor(registry, *job).await });
                let msg = match execution.await {
                    Ok(Ok(result)) => WorkerMessage::Success {
                        worker_id,
                        job_id,
                        result,
                    },
                    Ok(Err(error)) => WorkerMessage::Failure {
                        worker_id,
                        job_id,
                        error,
                    },
                    Err(join_err) => {
                        let error = match join_err.try_into_panic() {
                            Ok(payload) => panic_message(payload.as_ref()),
                            Err(err) => err.to_string(),
                        };
                        WorkerMessage::Crashed { worker_id, error }
                    }
                };
                if msg_tx.send(msg).await.is_err() {
                    break;
                }
            }
            WorkerCommand::Terminate => {
                let _ = msg_tx
                    .send(WorkerMessage::Terminated { worker_id })
                    .await;
                break;
            }
        }
    }
    worker_id
}

async fn run_executor(
    registry: Arc<ExecutorRegistry>,
    job: Job,
) -> std::result::Result<Value, String> {
    match registry.get(job.kind) {
        Some(executor) => executor.execute(&job).await,
        None => Err(format!("no executor registered for {}", job.kind)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("executor panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("executor panicked: {message}")
    } else {
        "executor panicked".to_string()
    }
}
