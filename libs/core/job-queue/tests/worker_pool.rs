//! Worker pool behavior: retries, backoff, concurrency, timeouts, and the
//! degraded store.

mod support;

use job_queue::{
    ClassConfig, DiscardStore, EnqueueOptions, JobClass, JobStatus, JobSystem, QueueConfig,
};
use std::sync::Arc;
use std::time::Duration;
use support::{email_payload, wait_until, MemoryStore, SpyHandler};

fn fast_config() -> QueueConfig {
    QueueConfig::degraded()
        .with_poll_interval(Duration::from_millis(10))
        .with_grace_window(Duration::from_secs(2))
}

fn email_class(base_delay_ms: u64, max_attempts: u32) -> ClassConfig {
    ClassConfig::for_class(JobClass::Email)
        .with_base_delay(Duration::from_millis(base_delay_ms))
        .with_max_attempts(max_attempts)
}

#[tokio::test]
async fn enqueue_returns_before_any_processing() {
    let store = Arc::new(MemoryStore::new());
    let system = JobSystem::builder(fast_config())
        .with_store(store.clone())
        .build();

    // No start(): nothing consumes, enqueue must still return immediately.
    let service = system.service();
    let started = std::time::Instant::now();
    let id = service
        .enqueue_email(email_payload(), EnqueueOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    let record = store.record(id).unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempt, 0);
}

#[tokio::test]
async fn failing_job_retries_then_fails_permanently() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::always_failing();
    let system = JobSystem::builder(
        fast_config().with_class(JobClass::Email, email_class(20, 3)),
    )
    .with_store(store.clone())
    .handler(JobClass::Email, handler.clone())
    .build();
    system.start().await.unwrap();

    let id = system
        .service()
        .enqueue_email(email_payload(), EnqueueOptions::default())
        .await
        .unwrap();

    let failed = wait_until(
        || store.status(id) == Some(JobStatus::Failed),
        Duration::from_secs(5),
    )
    .await;
    assert!(failed, "job never reached Failed");

    // Three attempts total, attempt counter climbing 0, 1, 2.
    assert_eq!(handler.invocations(), 3);
    assert_eq!(handler.seen_attempts(), vec![0, 1, 2]);

    // Terminal record keeps the final attempt counter and the error.
    let record = store.record(id).unwrap();
    assert_eq!(record.attempt, 2);
    assert_eq!(record.max_attempts, 3);
    assert!(matches!(
        record.result,
        Some(job_queue::JobOutcome::Error { .. })
    ));
    assert_eq!(store.failed_count(JobClass::Email), 1);

    system.shutdown().await.unwrap();

    // No further invocations once terminal.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.invocations(), 3);
}

#[tokio::test]
async fn retry_backoff_doubles_per_attempt() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::always_failing();
    let base = 50u64;
    let system = JobSystem::builder(
        fast_config().with_class(JobClass::Email, email_class(base, 3)),
    )
    .with_store(store.clone())
    .handler(JobClass::Email, handler.clone())
    .build();
    system.start().await.unwrap();

    let id = system
        .service()
        .enqueue_email(email_payload(), EnqueueOptions::default())
        .await
        .unwrap();
    wait_until(
        || store.status(id) == Some(JobStatus::Failed),
        Duration::from_secs(5),
    )
    .await;
    system.shutdown().await.unwrap();

    let reschedules = store.reschedules();
    assert_eq!(reschedules.len(), 2);

    // First retry waits ~2x base, second ~4x base.
    let tolerance = Duration::from_millis(30);
    for (reschedule, expected_ms) in reschedules.iter().zip([2 * base, 4 * base]) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            reschedule.delay + tolerance >= expected && reschedule.delay <= expected,
            "attempt {} delay {:?}, expected ~{:?}",
            reschedule.attempt,
            reschedule.delay,
            expected
        );
    }
    assert_eq!(reschedules[0].attempt, 1);
    assert_eq!(reschedules[1].attempt, 2);
}

#[tokio::test]
async fn per_enqueue_max_attempts_overrides_class_default() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::always_failing();
    let system = JobSystem::builder(
        fast_config().with_class(JobClass::Email, email_class(10, 3)),
    )
    .with_store(store.clone())
    .handler(JobClass::Email, handler.clone())
    .build();
    system.start().await.unwrap();

    let id = system
        .service()
        .enqueue_email(
            email_payload(),
            EnqueueOptions::default().with_max_attempts(1),
        )
        .await
        .unwrap();

    wait_until(
        || store.status(id) == Some(JobStatus::Failed),
        Duration::from_secs(5),
    )
    .await;
    system.shutdown().await.unwrap();

    // Single attempt, no retries.
    assert_eq!(handler.invocations(), 1);
    assert!(store.reschedules().is_empty());
}

#[tokio::test]
async fn concurrency_never_exceeds_class_limit() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::slow(Duration::from_millis(100));
    let system = JobSystem::builder(
        fast_config().with_class(
            JobClass::Email,
            ClassConfig::for_class(JobClass::Email).with_concurrency(3),
        ),
    )
    .with_store(store.clone())
    .handler(JobClass::Email, handler.clone())
    .build();
    system.start().await.unwrap();

    let service = system.service();
    for _ in 0..10 {
        service
            .enqueue_email(email_payload(), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let drained = wait_until(
        || store.completed_count(JobClass::Email) == 10,
        Duration::from_secs(10),
    )
    .await;
    assert!(drained, "jobs did not all complete");
    system.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 10);
    assert!(
        handler.peak_concurrency() <= 3,
        "peak concurrency {} exceeded limit 3",
        handler.peak_concurrency()
    );
}

#[tokio::test]
async fn handler_timeout_counts_as_failed_attempt() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::slow(Duration::from_secs(10));
    let system = JobSystem::builder(fast_config().with_class(
        JobClass::Email,
        email_class(10, 1).with_execution_timeout(Duration::from_millis(50)),
    ))
    .with_store(store.clone())
    .handler(JobClass::Email, handler.clone())
    .build();
    system.start().await.unwrap();

    let id = system
        .service()
        .enqueue_email(email_payload(), EnqueueOptions::default())
        .await
        .unwrap();

    let failed = wait_until(
        || store.status(id) == Some(JobStatus::Failed),
        Duration::from_secs(5),
    )
    .await;
    assert!(failed, "timed-out job never reached Failed");
    system.shutdown().await.unwrap();

    let record = store.record(id).unwrap();
    match record.result {
        Some(job_queue::JobOutcome::Error { message }) => {
            assert!(message.contains("timed out"), "unexpected error: {message}");
        }
        other => panic!("expected error outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn job_succeeds_on_final_attempt() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::failing_first(2);
    let system = JobSystem::builder(
        fast_config().with_class(JobClass::Email, email_class(20, 3)),
    )
    .with_store(store.clone())
    .handler(JobClass::Email, handler.clone())
    .build();
    system.start().await.unwrap();

    let id = system
        .service()
        .enqueue_email(email_payload(), EnqueueOptions::default())
        .await
        .unwrap();

    let completed = wait_until(
        || store.status(id) == Some(JobStatus::Completed),
        Duration::from_secs(5),
    )
    .await;
    assert!(completed, "job never completed");
    system.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 3);

    let record = store.record(id).unwrap();
    assert_eq!(record.attempt, 2);
    assert!(matches!(
        record.result,
        Some(job_queue::JobOutcome::Success { .. })
    ));
    assert_eq!(store.completed_count(JobClass::Email), 1);
    assert_eq!(store.failed_count(JobClass::Email), 0);
}

#[tokio::test]
async fn terminal_transition_is_idempotent() {
    use job_queue::JobStore;

    let store = MemoryStore::new();
    let job = support::email_job(3);
    store.put(&job).await.unwrap();
    let job = store.take(JobClass::Email).await.unwrap().unwrap();

    store.mark_completed(&job, None).await.unwrap();
    store.mark_completed(&job, None).await.unwrap();
    assert_eq!(store.completed_count(JobClass::Email), 1);

    // A completed job cannot be re-marked as failed.
    store.mark_failed(&job, "late error").await.unwrap();
    assert_eq!(store.status(job.id), Some(JobStatus::Completed));
    assert_eq!(store.failed_count(JobClass::Email), 0);
}

#[tokio::test]
async fn degraded_store_never_runs_handlers() {
    let handler = SpyHandler::succeeding();
    let system = JobSystem::builder(fast_config())
        .with_store(Arc::new(DiscardStore::new()))
        .handler(JobClass::Email, handler.clone())
        .build();
    system.start().await.unwrap();

    // Enqueue still returns an id.
    system
        .service()
        .enqueue_email(email_payload(), EnqueueOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    system.shutdown().await.unwrap();

    assert_eq!(handler.invocations(), 0);
}

#[tokio::test]
async fn delayed_enqueue_waits_for_schedule() {
    let store = Arc::new(MemoryStore::new());
    let handler = SpyHandler::succeeding();
    let system = JobSystem::builder(fast_config())
        .with_store(store.clone())
        .handler(JobClass::Email, handler.clone())
        .build();
    system.start().await.unwrap();

    let id = system
        .service()
        .enqueue_email(
            email_payload(),
            EnqueueOptions::default().with_delay(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    // Not picked up before the delay elapses.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.invocations(), 0);
    assert_eq!(store.status(id), Some(JobStatus::Pending));

    let completed = wait_until(
        || store.status(id) == Some(JobStatus::Completed),
        Duration::from_secs(5),
    )
    .await;
    assert!(completed, "delayed job never ran");
    system.shutdown().await.unwrap();
}
