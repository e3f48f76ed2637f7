
use std::sync::Arc;
use std::time::Duration;

use courier_queue::error::QueueError;
use courier_queue::events::{EventBus, JobEventKind};
use courier_queue::queue::{JobKind, JobStatus, JobStore, QueueManager, RetryPolicy};

use test_harness::{email_payload, EventCollector};

fn manager(events: EventBus) -> Arc<QueueManager> {
    let store = JobStore::new(100, 3);
    let retry = RetryPolicy::new(Duration::from_millis(100), 0.0);
    Arc::new(QueueManager::new(store, events, retry))
}

#[tokio::test]
async fn create_job_emits_created() {
    let events = EventBus::new(64);
    let collector = EventCollector::attach(&events);
    let queue = manager(events);

    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), None)
        .await
        .unwrap();

    collector
        .wait_for_count(job.id, 1, Duration::from_secs(1))
        .await;
    assert_eq!(
        collector.kinds_for(job.id).await,
        vec![JobEventKind::Created]
    );
}

#[tokio::test]
async fn start_job_rejects_a_running_job() {
    let queue = manager(EventBus::new(64));
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), None)
        .await
        .unwrap();

    let started = queue.start_job(job.id).await.unwrap();
    assert_eq!(started.status, JobStatus::Running);
    assert_eq!(started.attempts, 1);

    let err = queue.start_job(job.id).await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyRunning(id) if id == job.id));
}

#[tokio::test]
async fn fail_job_schedules_a_retry_with_exponential_backoff() {
    let events = EventBus::new(64);
    let collector = EventCollector::attach(&events);
    let queue = manager(events);
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), None)
        .await
        .unwrap();

    queue.start_job(job.id).await.unwrap();
    let failed = queue.fail_job(job.id, "smtp timeout").await.unwrap();
    assert_eq!(failed.status, JobStatus::Retrying);
    assert!(failed.retry_at.is_some());
    assert_eq!(failed.error.as_deref(), Some("smtp timeout"));

    collector
        .wait_for_count(job.id, 4, Duration::from_secs(1))
        .await;
    assert_eq!(
        collector.kinds_for(job.id).await,
        vec![
            JobEventKind::Created,
            JobEventKind::Started,
            JobEventKind::Failed,
            JobEventKind::Retrying,
        ]
    );

    // The first retry uses the base delay.
    let retrying = collector
        .all()
        .await
        .into_iter()
        .find(|event| event.kind == JobEventKind::Retrying)
        .unwrap();
    assert_eq!(retrying.retry_delay_ms, Some(100));
}

#[tokio::test]
async fn retry_delay_doubles_per_attempt() {
    let events = EventBus::new(64);
    let collector = EventCollector::attach(&events);
    let queue = manager(events);
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), None)
        .await
        .unwrap();

    queue.start_job(job.id).await.unwrap();
    queue.fail_job(job.id, "first").await.unwrap();
    queue.start_job(job.id).await.unwrap();
    queue.fail_job(job.id, "second").await.unwrap();

    collector
        .wait_for_count(job.id, 7, Duration::from_secs(1))
        .await;
    let delays: Vec<_> = collector
        .all()
        .await
        .into_iter()
        .filter(|event| event.kind == JobEventKind::Retrying)
        .map(|event| event.retry_delay_ms.unwrap())
        .collect();
    assert_eq!(delays, vec![100, 200]);
}

#[tokio::test]
async fn fail_job_at_the_limit_parks_the_job_dead() {
    let events = EventBus::new(64);
    let collector = EventCollector::attach(&events);
    let queue = manager(events);
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), Some(1))
        .await
        .unwrap();

    queue.start_job(job.id).await.unwrap();
    let dead = queue.fail_job(job.id, "permanent failure").await.unwrap();
    assert_eq!(dead.status, JobStatus::Dead);
    assert_eq!(dead.attempts, 1);
    assert!(dead.finished_at.is_some());

    collector
        .wait_for_count(job.id, 4, Duration::from_secs(1))
        .await;
    assert_eq!(
        collector.kinds_for(job.id).await,
        vec![
            JobEventKind::Created,
            JobEventKind::Started,
            JobEventKind::Failed,
            JobEventKind::Dead,
        ]
    );
}

#[tokio::test]
async fn terminal_jobs_reject_complete_and_fail() {
    let queue = manager(EventBus::new(64));
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), Some(1))
        .await
        .unwrap();

    queue.start_job(job.id).await.unwrap();
    queue.fail_job(job.id, "gone").await.unwrap();

    assert!(matches!(
        queue.complete_job(job.id).await.unwrap_err(),
        QueueError::IllegalTransition { .. }
    ));
    assert!(matches!(
        queue.fail_job(job.id, "again").await.unwrap_err(),
        QueueError::IllegalTransition { .. }
    ));
}

#[tokio::test]
async fn started_at_tracks_the_most_recent_start() {
    let queue = manager(EventBus::new(64));
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), None)
        .await
        .unwrap();

    let first = queue.start_job(job.id).await.unwrap();
    queue.fail_job(job.id, "flaky").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = queue.start_job(job.id).await.unwrap();

    assert_eq!(second.attempts, 2);
    assert!(second.started_at.unwrap() > first.started_at.unwrap());
}

#[tokio::test]
async fn complete_job_stamps_finished_at_after_started_at() {
    let queue = manager(EventBus::new(64));
    let job = queue
        .create_job(JobKind::SendEmail, email_payload(), None)
        .await
        .unwrap();

    queue.start_job(job.id).await.unwrap();
    let completed = queue.complete_job(job.id).await.unwrap();

    assert_eq!(completed.status, JobStatus::Completed);
    assert!(completed.finished_at.unwrap() >= completed.started_at.unwrap());
}

#[test]
fn backoff_law_doubles_from_the_base() {
    let policy = RetryPolicy::new(Duration::from_millis(1000), 0.0);
    assert_eq!(policy.next_delay(1), Duration::from_millis(1000));
    assert_eq!(policy.next_delay(2), Duration::from_millis(2000));
    assert_eq!(policy.next_delay(3), Duration::from_millis(4000));
    assert_eq!(policy.next_delay(4), Duration::from_millis(8000));
}

#[test]
fn backoff_jitter_is_bounded() {
    let policy = RetryPolicy::new(Duration::from_millis(1000), 0.1);
    for attempts in 1..=4u32 {
        let exact = 1000u64 << (attempts - 1);
        for _ in 0..50 {
            let delay = policy.next_delay(attempts).as_millis() as u64;
            assert!(delay >= exact, "jitter must never shorten the delay");
            assert!(delay <= exact + exact / 10, "jitter above 10% of {exact}: {delay}");
        }
    }
}
