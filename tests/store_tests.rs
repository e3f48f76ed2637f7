use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use courier_queue::error::QueueError;
use courier_queue::queue::{JobKind, JobStatus, JobStore};

fn store() -> JobStore {
    JobStore::new(100, 3)
}

#[test]
fn create_assigns_pending_and_is_retrievable() {
    let mut store = store();
    let job = store.create(JobKind::SendEmail, json!({}), None).unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.started_at.is_none());

    let retrieved = store.get(job.id).unwrap();
    assert_eq!(retrieved.id, job.id);
    assert_eq!(retrieved.status, JobStatus::Pending);
}

#[test]
fn create_fails_when_full_and_leaves_count_unchanged() {
    let mut store = JobStore::new(3, 3);
    for _ in 0..3 {
        store.create(JobKind::SendEmail, json!({}), None).unwrap();
    }

    let err = store.create(JobKind::SendEmail, json!({}), None).unwrap_err();
    assert!(matches!(err, QueueError::QueueFull(3)));
    assert_eq!(store.len(), 3);
    assert!(store.is_full());
}

#[test]
fn mark_started_consumes_an_attempt() {
    let mut store = store();
    let job = store.create(JobKind::SendEmail, json!({}), None).unwrap();

    let started = store.mark_started(job.id).unwrap();
    assert_eq!(started.status, JobStatus::Running);
    assert_eq!(started.attempts, 1);
    assert!(started.started_at.is_some());
    assert!(store.is_running(job.id));

    let stats = store.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.total, 1);
}

#[test]
fn terminal_jobs_reject_further_transitions() {
    let mut store = store();
    let job = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    store.mark_started(job.id).unwrap();
    store.mark_completed(job.id).unwrap();

    let err = store.mark_started(job.id).unwrap_err();
    assert!(matches!(
        err,
        QueueError::IllegalTransition {
            from: JobStatus::Completed,
            ..
        }
    ));
}

#[test]
fn mark_failed_decides_dead_at_the_attempt_limit() {
    let mut store = store();
    let job = store
        .create(JobKind::SendEmail, json!({}), Some(1))
        .unwrap();
    store.mark_started(job.id).unwrap();

    let failed = store.mark_failed(job.id, "smtp refused").unwrap();
    assert_eq!(failed.status, JobStatus::Dead);
    assert_eq!(failed.attempts, failed.max_attempts);
    assert_eq!(failed.error.as_deref(), Some("smtp refused"));
    assert!(failed.finished_at.is_some());
}

#[test]
fn mark_failed_keeps_jobs_with_remaining_attempts_retryable() {
    let mut store = store();
    let job = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    store.mark_started(job.id).unwrap();

    let failed = store.mark_failed(job.id, "timeout").unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    let retry_at = Utc::now() + chrono::Duration::milliseconds(100);
    let retrying = store.mark_retrying(job.id, retry_at).unwrap();
    assert_eq!(retrying.status, JobStatus::Retrying);
    assert_eq!(retrying.retry_at, Some(retry_at));
}

#[test]
fn ready_for_execution_is_fifo_and_gated_on_retry_at() {
    let mut store = store();

    let first = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    let second = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    let third = store.create(JobKind::SendEmail, json!({}), None).unwrap();

    // second: retrying with an elapsed retry_at, so it stays eligible.
    store.mark_started(second.id).unwrap();
    store.mark_failed(second.id, "flaky").unwrap();
    store
        .mark_retrying(second.id, Utc::now() - chrono::Duration::milliseconds(1))
        .unwrap();

    // third: retrying in the far future, so it is excluded.
    store.mark_started(third.id).unwrap();
    store.mark_failed(third.id, "flaky").unwrap();
    store
        .mark_retrying(third.id, Utc::now() + chrono::Duration::seconds(60))
        .unwrap();

    let ready: Vec<_> = store
        .ready_for_execution(Utc::now())
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ready, vec![first.id, second.id]);
}

#[test]
fn ready_for_execution_never_returns_running_or_terminal_jobs() {
    let mut store = store();

    let running = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    store.mark_started(running.id).unwrap();

    let completed = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    store.mark_started(completed.id).unwrap();
    store.mark_completed(completed.id).unwrap();

    let dead = store
        .create(JobKind::SendEmail, json!({}), Some(1))
        .unwrap();
    store.mark_started(dead.id).unwrap();
    store.mark_failed(dead.id, "gone").unwrap();

    assert!(store.ready_for_execution(Utc::now()).is_empty());
}

#[test]
fn transition_on_unknown_id_fails() {
    let mut store = store();
    let err = store.mark_started(uuid::Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));
}

#[test]
fn stats_counts_every_bucket() {
    let mut store = store();
    let a = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    let b = store.create(JobKind::SendEmail, json!({}), None).unwrap();
    store.create(JobKind::SendEmail, json!({}), None).unwrap();

    store.mark_started(a.id).unwrap();
    store.mark_started(b.id).unwrap();
    store.mark_completed(b.id).unwrap();

    let stats = store.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.total, 3);
}
