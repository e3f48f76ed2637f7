
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use courier_queue::error::QueueError;
use courier_queue::queue::{Job, JobKind};
use courier_queue::worker::{ExecutorRegistry, WorkerPool};

use test_harness::{ExecStep, ScriptedExecutor};

fn job() -> Job {
    Job::new(JobKind::SendEmail, json!({}), 3)
}

async fn pool_with(
    pool_size: usize,
    executor: Arc<ScriptedExecutor>,
) -> Arc<WorkerPool> {
    let mut registry = ExecutorRegistry::new();
    registry.register(JobKind::SendEmail, executor);
    WorkerPool::start(pool_size, Duration::from_secs(5), Arc::new(registry))
        .await
        .expect("worker pool should start")
}

/// Poll pool stats until the predicate holds.
async fn wait_for_stats(
    pool: &WorkerPool,
    timeout: Duration,
    predicate: impl Fn(courier_queue::worker::PoolStats) -> bool,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate(pool.stats()) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for pool stats, currently {:?}", pool.stats());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn start_brings_up_the_full_pool() {
    let pool = pool_with(4, ScriptedExecutor::always_succeed()).await;
    let stats = pool.stats();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.available, 4);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn execute_returns_the_executor_result() {
    let pool = pool_with(2, ScriptedExecutor::always_succeed()).await;
    let result = pool.execute(job()).await.unwrap();
    assert_eq!(result, json!({ "ok": true }));
}

#[tokio::test]
async fn executor_errors_surface_as_structured_failures() {
    let executor = ScriptedExecutor::new(vec![ExecStep::Fail("mailbox unavailable")]);
    let pool = pool_with(1, executor).await;

    let err = pool.execute(job()).await.unwrap_err();
    match err {
        QueueError::Executor(message) => assert_eq!(message, "mailbox unavailable"),
        other => panic!("expected executor error, got {other}"),
    }
}

#[tokio::test]
async fn unregistered_job_kind_fails_execution() {
    let pool = WorkerPool::start(1, Duration::from_secs(5), Arc::new(ExecutorRegistry::new()))
        .await
        .unwrap();

    let err = pool.execute(job()).await.unwrap_err();
    match err {
        QueueError::Executor(message) => {
            assert!(message.contains("no executor registered"), "{message}")
        }
        other => panic!("expected executor error, got {other}"),
    }
}

#[tokio::test]
async fn waiting_calls_are_served_in_fifo_order() {
    let executor = ScriptedExecutor::new(vec![
        ExecStep::SleepThenSucceed(Duration::from_millis(50)),
        ExecStep::SleepThenSucceed(Duration::from_millis(50)),
        ExecStep::SleepThenSucceed(Duration::from_millis(50)),
    ]);
    let pool = pool_with(1, executor).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for index in 0..3u32 {
        let pool = Arc::clone(&pool);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            pool.execute(job()).await.unwrap();
            order.lock().await.push(index);
        }));
        // Stagger submissions so arrival order is deterministic.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().await, vec![0, 1, 2]);
}

#[tokio::test]
async fn a_crashed_worker_fails_the_job_and_is_replaced() {
    let executor = ScriptedExecutor::new(vec![ExecStep::Panic("executor blew up")]);
    let pool = pool_with(2, executor).await;

    let err = pool.execute(job()).await.unwrap_err();
    match err {
        QueueError::WorkerCrashed { message, .. } => {
            assert!(message.contains("executor blew up"), "{message}")
        }
        other => panic!("expected worker crash, got {other}"),
    }

    // The pool self-heals back to full strength.
    wait_for_stats(&pool, Duration::from_secs(2), |stats| {
        stats.total == 2 && stats.available == 2
    })
    .await;

    // And keeps executing jobs normally.
    let result = pool.execute(job()).await.unwrap();
    assert_eq!(result, json!({ "ok": true }));
}

#[tokio::test]
async fn shutdown_waits_for_busy_workers_and_rejects_new_work() {
    let executor = ScriptedExecutor::new(vec![ExecStep::SleepThenSucceed(
        Duration::from_millis(200),
    )]);
    let pool = pool_with(1, executor.clone()).await;

    let busy_pool = Arc::clone(&pool);
    let in_flight = tokio::spawn(async move { busy_pool.execute(job()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;

    // The in-flight job was allowed to finish.
    assert!(in_flight.await.unwrap().is_ok());
    assert_eq!(executor.calls(), 1);

    // New work is rejected once draining.
    let err = pool.execute(job()).await.unwrap_err();
    assert!(matches!(err, QueueError::PoolShuttingDown));

    let stats = pool.stats();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let pool = pool_with(2, ScriptedExecutor::always_succeed()).await;
    pool.shutdown().await;
    pool.shutdown().await;
    assert_eq!(pool.stats().total, 0);
}

#[tokio::test]
async fn queued_waiters_are_rejected_on_shutdown() {
    let executor = ScriptedExecutor::new(vec![ExecStep::SleepThenSucceed(
        Duration::from_millis(200),
    )]);
    let pool = pool_with(1, executor).await;

    let busy_pool = Arc::clone(&pool);
    let running = tokio::spawn(async move { busy_pool.execute(job()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // This call queues behind the busy worker and must be rejected by
    // the drain rather than started.
    let waiting_pool = Arc::clone(&pool);
    let waiting = tokio::spawn(async move { waiting_pool.execute(job()).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.shutdown().await;

    assert!(running.await.unwrap().is_ok());
    assert!(matches!(
        waiting.await.unwrap().unwrap_err(),
        QueueError::PoolShuttingDown
    ));
}
