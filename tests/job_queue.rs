// tests/job_queue.rs

mod common;
use crate::common::builders::{TEST_PREFIX, test_config};
use crate::common::fake_handlers::{BlockingHandler, FlakyHandler, MemoryHogHandler, RecordingHandler};
use crate::common::{init_tracing, with_timeout};

use std::sync::Arc;

use pipedag::backend::{KeySpace, KvBackend, MemoryBackend};
use pipedag::config::QueueSection;
use pipedag::errors::EngineError;
use pipedag::exec::HandlerRegistry;
use pipedag::governor::ResourceGovernor;
use pipedag::queue::{JobQueue, JobSubmission, QueueJobStatus};
use pipedag::types::{ErrorCategory, JobResult, JobSpec, ResourceLimits};

fn start_queue(registry: HandlerRegistry, concurrency: usize) -> JobQueue {
    let mut cfg = test_config();
    cfg.queue.concurrency = concurrency;
    start_queue_on(Arc::new(MemoryBackend::new()), registry, &cfg.queue)
}

/// Queue on a shared backend, e.g. to simulate a second worker process.
fn start_queue_on(backend: Arc<dyn KvBackend>, registry: HandlerRegistry, settings: &QueueSection) -> JobQueue {
    let cfg = test_config();
    JobQueue::start(
        backend,
        KeySpace::new(TEST_PREFIX),
        registry,
        ResourceGovernor::new(&cfg.governor),
        settings,
    )
}

fn worker_settings(worker_id: &str, concurrency: usize) -> QueueSection {
    let mut settings = test_config().queue;
    settings.worker_id = Some(worker_id.to_string());
    settings.concurrency = concurrency;
    settings
}

async fn outcome_of(queue: &JobQueue, id: &str) -> JobResult {
    let rx = queue
        .wait(id)
        .await
        .unwrap()
        .expect("job known to the queue");
    with_timeout(rx).await.expect("queue dropped the waiter")
}

#[tokio::test]
async fn higher_priority_jobs_start_first() {
    init_tracing();
    let recorder = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("record", recorder.clone());
    let queue = start_queue(registry, 1);

    queue.pause().await.unwrap();
    let mut ids = Vec::new();
    for (id, priority) in [("low", 1), ("high", 9), ("none-a", 0), ("mid", 5), ("none-b", 0)] {
        let spec = JobSpec::new(id, "record").with_priority(priority);
        ids.push(queue.submit_job(JobSubmission::new("e1", spec)).await.unwrap());
    }
    assert_eq!(queue.get_job_status(&ids[1]).await.unwrap(), QueueJobStatus::Prioritized);
    assert_eq!(queue.get_job_status(&ids[2]).await.unwrap(), QueueJobStatus::Waiting);

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.paused, 5);
    assert_eq!(stats.waiting, 0);
    assert!(queue.is_paused().await.unwrap());

    queue.resume().await.unwrap();
    for id in &ids {
        assert!(outcome_of(&queue, id).await.success);
    }

    assert_eq!(recorder.started(), vec!["high", "mid", "low", "none-a", "none-b"]);
    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.active, 0);
}

#[tokio::test(start_paused = true)]
async fn failing_job_is_attempted_max_retries_plus_one_times() {
    init_tracing();
    let flaky = FlakyHandler::always();
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", flaky.clone());
    let queue = start_queue(registry, 2);

    let spec = JobSpec::new("train", "flaky").with_max_retries(2);
    let id = queue.submit_job(JobSubmission::new("e1", spec)).await.unwrap();
    let result = outcome_of(&queue, &id).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.error_category, Some(ErrorCategory::Handler));
    assert_eq!(result.worker_id.as_deref(), Some("test-worker"));
    assert_eq!(flaky.attempts_of("train"), vec![1, 2, 3]);
    assert_eq!(queue.get_job_status(&id).await.unwrap(), QueueJobStatus::Failed);

    let record = queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts_made, 3);
    assert!(record.claimed_by.is_none());
    assert!(record.lease_expires_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_retry() {
    init_tracing();
    let flaky = FlakyHandler::new(1);
    let mut registry = HandlerRegistry::new();
    registry.register("flaky", flaky.clone());
    let queue = start_queue(registry, 2);

    let spec = JobSpec::new("fetch", "flaky").with_max_retries(3);
    let id = queue.submit_job(JobSubmission::new("e1", spec)).await.unwrap();
    let result = outcome_of(&queue, &id).await;

    assert!(result.success);
    assert_eq!(result.attempts, 2);
    assert_eq!(result.output.unwrap()["attempt"], 2);
}

#[test]
fn backoff_is_exponential_and_capped() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let queue = start_queue(HandlerRegistry::new(), 1);
        let delays: Vec<u128> = (1..=5).map(|a| queue.backoff_delay(a).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100]);
        queue.shutdown().await;
    });
}

#[tokio::test]
async fn queued_job_can_be_cancelled_but_finished_job_cannot() {
    init_tracing();
    let mut registry = HandlerRegistry::new();
    registry.register("record", RecordingHandler::new());
    let queue = start_queue(registry, 1);

    queue.pause().await.unwrap();
    let id = queue
        .submit_job(JobSubmission::new("e1", JobSpec::new("A", "record")))
        .await
        .unwrap();
    assert!(queue.cancel_job(&id).await.unwrap());
    assert_eq!(queue.get_job_status(&id).await.unwrap(), QueueJobStatus::NotFound);
    assert!(queue.wait(&id).await.unwrap().is_none());

    queue.resume().await.unwrap();
    let id = queue
        .submit_job(JobSubmission::new("e1", JobSpec::new("B", "record")))
        .await
        .unwrap();
    assert!(outcome_of(&queue, &id).await.success);
    assert!(!queue.cancel_job(&id).await.unwrap());
    assert_eq!(queue.get_job_status(&id).await.unwrap(), QueueJobStatus::Completed);
}

#[tokio::test]
async fn aborted_active_job_fails_with_the_given_category_and_is_not_retried() {
    init_tracing();
    let blocking = BlockingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("block", blocking.clone());
    let queue = start_queue(registry, 1);

    let spec = JobSpec::new("long", "block").with_max_retries(3);
    let id = queue.submit_job(JobSubmission::new("e1", spec)).await.unwrap();
    with_timeout(blocking.wait_started(1)).await;
    assert_eq!(queue.get_job_status(&id).await.unwrap(), QueueJobStatus::Active);

    assert!(queue.abort(&id, ErrorCategory::Timeout).await.unwrap());
    let result = outcome_of(&queue, &id).await;

    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::Timeout));
    assert_eq!(result.attempts, 1);
    assert_eq!(blocking.started(), 1);
    assert!(!queue.abort(&id, ErrorCategory::Cancelled).await.unwrap());
}

#[tokio::test]
async fn queued_job_aborted_before_it_starts_fails_without_running() {
    init_tracing();
    let recorder = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("record", recorder.clone());
    let queue = start_queue(registry, 1);

    queue.pause().await.unwrap();
    let id = queue
        .submit_job(JobSubmission::new("e1", JobSpec::new("A", "record")))
        .await
        .unwrap();
    assert!(queue.abort(&id, ErrorCategory::Cancelled).await.unwrap());

    let result = outcome_of(&queue, &id).await;
    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::Cancelled));
    assert_eq!(result.attempts, 0);

    queue.resume().await.unwrap();
    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.waiting, 0);
    assert!(recorder.started().is_empty());
}

#[tokio::test(start_paused = true)]
async fn memory_ceiling_violation_fails_the_job_without_retry() {
    init_tracing();
    let mut registry = HandlerRegistry::new();
    registry.register("hog", MemoryHogHandler::new(4096.0));
    let queue = start_queue(registry, 1);

    let limits = ResourceLimits {
        max_memory_mb: Some(100),
        enforce_memory_limit: true,
        ..Default::default()
    };
    let spec = JobSpec::new("hog", "hog")
        .with_resource_limits(limits)
        .with_max_retries(2);
    let id = queue.submit_job(JobSubmission::new("e1", spec)).await.unwrap();
    let result = outcome_of(&queue, &id).await;

    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::ResourceViolation));
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("memory"));
}

#[tokio::test]
async fn invalid_submissions_are_rejected_and_bulk_is_all_or_nothing() {
    init_tracing();
    let mut registry = HandlerRegistry::new();
    registry.register("record", RecordingHandler::new());
    let queue = start_queue(registry, 1);
    queue.pause().await.unwrap();
    assert!(queue.is_healthy().await);

    let too_high = JobSpec::new("A", "record").with_priority(11);
    assert!(matches!(
        queue.submit_job(JobSubmission::new("e1", too_high)).await,
        Err(EngineError::Validation(_))
    ));

    let unknown = JobSpec::new("B", "nope");
    let bulk = vec![
        JobSubmission::new("e1", JobSpec::new("ok", "record")),
        JobSubmission::new("e1", unknown),
    ];
    assert!(matches!(
        queue.submit_jobs_bulk(bulk).await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(queue.get_queue_stats().await.unwrap().paused, 0);

    let ids = queue
        .submit_jobs_bulk(vec![
            JobSubmission::new("e1", JobSpec::new("x", "record")),
            JobSubmission::new("e1", JobSpec::new("y", "record")),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(queue.get_queue_stats().await.unwrap().paused, 2);

    queue.shutdown().await;
    assert!(!queue.is_healthy().await);
    assert!(matches!(
        queue
            .submit_job(JobSubmission::new("e1", JobSpec::new("z", "record")))
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn finished_jobs_beyond_retention_are_evicted() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let mut registry = HandlerRegistry::new();
    registry.register("record", RecordingHandler::new());
    let mut settings = worker_settings("w", 1);
    settings.retain_completed = 10;
    let queue = start_queue_on(backend.clone(), registry, &settings);

    queue.pause().await.unwrap();
    let mut ids = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..50 {
        let spec = JobSpec::new(format!("job-{i}"), "record");
        let id = queue.submit_job(JobSubmission::new("e1", spec)).await.unwrap();
        receivers.push(queue.wait(&id).await.unwrap().unwrap());
        ids.push(id);
    }

    queue.resume().await.unwrap();
    for rx in receivers {
        assert!(with_timeout(rx).await.unwrap().success);
    }

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 10);
    assert!(queue.get_job(&ids[0]).await.unwrap().is_none());
    assert_eq!(queue.get_job_status(&ids[0]).await.unwrap(), QueueJobStatus::NotFound);
    assert!(queue.get_job(&ids[49]).await.unwrap().is_some());

    let records = backend
        .keys_with_prefix(&format!("{TEST_PREFIX}:queue:job:"))
        .await;
    assert_eq!(records.len(), 10);
    queue.shutdown().await;
}

#[tokio::test]
async fn queued_jobs_survive_a_worker_restart() {
    init_tracing();
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());

    let mut registry = HandlerRegistry::new();
    registry.register("record", RecordingHandler::new());
    let first = start_queue_on(Arc::clone(&backend), registry, &worker_settings("first", 4));
    first.pause().await.unwrap();
    let id = first
        .submit_job(JobSubmission::new("e1", JobSpec::new("A", "record")))
        .await
        .unwrap();
    first.shutdown().await;

    let recorder = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("record", recorder.clone());
    let second = start_queue_on(Arc::clone(&backend), registry, &worker_settings("second", 4));
    assert_eq!(second.get_queue_stats().await.unwrap().paused, 1);
    second.resume().await.unwrap();

    let result = outcome_of(&second, &id).await;
    assert!(result.success);
    assert_eq!(result.worker_id.as_deref(), Some("second"));
    assert_eq!(recorder.started(), vec!["A"]);
    second.shutdown().await;
}

#[tokio::test]
async fn workers_on_one_backend_share_the_ready_list() {
    init_tracing();
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());

    // The submitting worker has a single slot, taken by a job that never ends.
    let blocking = BlockingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("block", blocking.clone());
    registry.register("record", RecordingHandler::new());
    let busy = start_queue_on(Arc::clone(&backend), registry, &worker_settings("busy", 1));

    let recorder = RecordingHandler::new();
    let mut registry = HandlerRegistry::new();
    registry.register("record", recorder.clone());
    let idle = start_queue_on(Arc::clone(&backend), registry, &worker_settings("idle", 2));

    let blocker = busy
        .submit_job(JobSubmission::new("e1", JobSpec::new("hold", "block")))
        .await
        .unwrap();
    with_timeout(blocking.wait_started(1)).await;

    let ids = busy
        .submit_jobs_bulk(vec![
            JobSubmission::new("e1", JobSpec::new("x", "record")),
            JobSubmission::new("e1", JobSpec::new("y", "record")),
        ])
        .await
        .unwrap();

    // Outcomes reach the submitting worker although the other one ran them.
    for id in &ids {
        let result = outcome_of(&busy, id).await;
        assert!(result.success);
        assert_eq!(result.worker_id.as_deref(), Some("idle"));
    }
    let mut started = recorder.started();
    started.sort();
    assert_eq!(started, vec!["x", "y"]);
    assert_eq!(blocking.started(), 1);

    // Abort from a worker that does not run the job.
    assert!(idle.abort(&blocker, ErrorCategory::Cancelled).await.unwrap());
    let result = outcome_of(&idle, &blocker).await;
    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::Cancelled));
    assert_eq!(result.worker_id.as_deref(), Some("busy"));
    assert_eq!(blocking.cancelled(), 1);

    busy.shutdown().await;
    idle.shutdown().await;
}
