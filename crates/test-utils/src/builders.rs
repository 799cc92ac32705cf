#![allow(dead_code)]

use std::sync::Arc;

use pipedag::backend::{KeySpace, KvBackend, MemoryBackend};
use pipedag::config::EngineConfig;
use pipedag::engine::Orchestrator;
use pipedag::exec::HandlerRegistry;
use pipedag::lock::LockManager;
use pipedag::state::StateStore;
use pipedag::types::JobSpec;

pub const TEST_PREFIX: &str = "test";

/// Engine config tuned for tests: tiny backoff, fast sampling and polling,
/// generous queue concurrency.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.backend.key_prefix = TEST_PREFIX.to_string();
    config.queue.concurrency = 8;
    config.queue.backoff_base_ms = 10;
    config.queue.backoff_max_ms = 100;
    config.queue.worker_id = Some("test-worker".to_string());
    config.queue.poll_interval_ms = 10;
    config.lock.retry_attempts = 50;
    config.lock.retry_delay_ms = 5;
    config.governor.sample_interval_ms = 10;
    config
}

/// Orchestrator on a fresh in-memory backend.
pub fn test_orchestrator(registry: HandlerRegistry) -> Orchestrator {
    test_orchestrator_on(Arc::new(MemoryBackend::new()), registry)
}

/// Orchestrator on a shared backend, e.g. to simulate a second instance.
pub fn test_orchestrator_on(backend: Arc<dyn KvBackend>, registry: HandlerRegistry) -> Orchestrator {
    Orchestrator::from_config(&test_config(), backend, registry)
}

pub fn test_state_store(backend: Arc<dyn KvBackend>) -> StateStore {
    StateStore::new(backend, KeySpace::new(TEST_PREFIX), &test_config().state)
}

pub fn test_lock_manager(backend: Arc<dyn KvBackend>) -> LockManager {
    LockManager::new(backend, KeySpace::new(TEST_PREFIX), test_config().lock)
}

/// Job of type `job_type` depending on `deps`.
pub fn job(id: &str, job_type: &str, deps: &[&str]) -> JobSpec {
    deps.iter()
        .fold(JobSpec::new(id, job_type), |spec, dep| spec.depends_on(*dep))
}

/// `A -> B -> C -> ...` over the given ids.
pub fn chain(ids: &[&str], job_type: &str) -> Vec<JobSpec> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| match i {
            0 => job(id, job_type, &[]),
            _ => job(id, job_type, &[ids[i - 1]]),
        })
        .collect()
}

/// `A -> {B, C} -> D`.
pub fn diamond(job_type: &str) -> Vec<JobSpec> {
    vec![
        job("A", job_type, &[]),
        job("B", job_type, &["A"]),
        job("C", job_type, &["A"]),
        job("D", job_type, &["B", "C"]),
    ]
}
