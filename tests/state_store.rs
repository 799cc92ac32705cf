// tests/state_store.rs

mod common;
use crate::common::builders::{TEST_PREFIX, test_config, test_state_store};
use crate::common::init_tracing;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, json};

use pipedag::backend::{KeySpace, KvBackend, MemoryBackend};
use pipedag::config::StateSection;
use pipedag::state::{CheckpointOptions, CheckpointRecord, StateStore};
use pipedag::types::{ExecutionState, ExecutionStatus, JobResult};

fn running(id: &str, workflow: &str) -> ExecutionState {
    let mut state = ExecutionState::new(id, workflow, workflow);
    state.status = ExecutionStatus::Running;
    state
}

#[tokio::test]
async fn a_job_is_completed_at_most_once_under_concurrency() {
    init_tracing();
    let store = test_state_store(Arc::new(MemoryBackend::new()));
    store.set_execution_state(&running("e1", "wf")).await.unwrap();
    assert!(store.add_current_job("e1", "train").await.unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let result = JobResult::succeeded("train", json!({ "writer": i }), Utc::now());
            store.complete_job("e1", "train", &result).await.unwrap()
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    let state = store.get_execution_state("e1").await.unwrap().unwrap();
    assert!(state.current_jobs.is_empty());
    assert_eq!(state.completed_jobs.len(), 1);
    assert!(state.failed_jobs.is_empty());
    assert!(state.job_results.contains_key("train"));

    // Terminal jobs cannot be dispatched again.
    assert!(!store.add_current_job("e1", "train").await.unwrap());
}

#[tokio::test]
async fn completion_of_an_undispatched_job_is_ignored() {
    init_tracing();
    let store = test_state_store(Arc::new(MemoryBackend::new()));
    store.set_execution_state(&running("e1", "wf")).await.unwrap();

    let result = JobResult::succeeded("ghost", json!(null), Utc::now());
    assert!(!store.complete_job("e1", "ghost", &result).await.unwrap());
    assert!(!store.complete_job("missing", "ghost", &result).await.unwrap());
}

#[tokio::test]
async fn terminal_status_stamps_completed_at_and_merges_metadata() {
    init_tracing();
    let store = test_state_store(Arc::new(MemoryBackend::new()));
    let mut state = running("e1", "wf");
    state.metadata.insert("owner".to_string(), json!("ml-team"));
    store.set_execution_state(&state).await.unwrap();

    let mut extra = Map::new();
    extra.insert("reason".to_string(), json!("done"));
    assert!(
        store
            .update_execution_status("e1", ExecutionStatus::Completed, Some(extra))
            .await
            .unwrap()
    );

    let state = store.get_execution_state("e1").await.unwrap().unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert!(state.completed_at.is_some());
    assert_eq!(state.metadata["owner"], "ml-team");
    assert_eq!(state.metadata["reason"], "done");
}

#[tokio::test(start_paused = true)]
async fn execution_state_expires_after_ttl() {
    init_tracing();
    let store = test_state_store(Arc::new(MemoryBackend::new()));
    store.set_execution_state(&running("e1", "wf")).await.unwrap();

    let ttl = Duration::from_secs(test_config().state.ttl_secs);
    tokio::time::advance(ttl - Duration::from_secs(1)).await;
    assert!(store.get_execution_state("e1").await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(store.get_execution_state("e1").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn workflow_index_lists_live_executions_and_prunes_expired_ones() {
    init_tracing();
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
    let short = StateStore::new(
        Arc::clone(&backend),
        KeySpace::new(TEST_PREFIX),
        &StateSection { ttl_secs: 1 },
    );
    let long = test_state_store(Arc::clone(&backend));

    short.set_execution_state(&running("old", "wf")).await.unwrap();
    tokio::time::advance(Duration::from_millis(10)).await;
    long.set_execution_state(&running("new", "wf")).await.unwrap();
    long.set_execution_state(&running("other", "other-wf")).await.unwrap();

    let ids: Vec<String> = long
        .get_workflow_executions("wf")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.execution_id)
        .collect();
    assert_eq!(ids, vec!["old", "new"]);

    tokio::time::advance(Duration::from_secs(2)).await;

    let ids: Vec<String> = long
        .get_workflow_executions("wf")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.execution_id)
        .collect();
    assert_eq!(ids, vec!["new"]);

    let index = backend
        .get(&KeySpace::new(TEST_PREFIX).workflow_index("wf"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index, r#"["new"]"#);
}

#[tokio::test(start_paused = true)]
async fn updates_keep_the_execution_listed_in_its_workflow() {
    init_tracing();
    let store = StateStore::new(
        Arc::new(MemoryBackend::new()),
        KeySpace::new(TEST_PREFIX),
        &StateSection { ttl_secs: 100 },
    );
    store.set_execution_state(&running("e1", "wf")).await.unwrap();

    tokio::time::advance(Duration::from_secs(90)).await;
    assert!(store.add_current_job("e1", "train").await.unwrap());

    // Past the first write's TTL, within the update's.
    tokio::time::advance(Duration::from_secs(20)).await;
    let listed: Vec<String> = store
        .get_workflow_executions("wf")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.execution_id)
        .collect();
    assert_eq!(listed, vec!["e1"]);
}

#[tokio::test]
async fn delete_removes_state_and_index_entry() {
    init_tracing();
    let store = test_state_store(Arc::new(MemoryBackend::new()));
    store.set_execution_state(&running("e1", "wf")).await.unwrap();

    assert!(store.delete_execution_state("e1").await.unwrap());
    assert!(!store.delete_execution_state("e1").await.unwrap());
    assert!(store.get_workflow_executions("wf").await.unwrap().is_empty());
    assert!(store.is_healthy().await);
}

#[tokio::test]
async fn checkpoints_round_trip_with_jobs_and_options() {
    init_tracing();
    let store = test_state_store(Arc::new(MemoryBackend::new()));
    let jobs = vec![pipedag::types::JobSpec::new("A", "noop")];
    let record = CheckpointRecord::new(
        running("e1", "wf"),
        jobs.clone(),
        CheckpointOptions {
            parallelism: 3,
            enable_cache: true,
        },
    );
    assert!(record.checkpoint_id.starts_with("ckpt-"));

    store.save_checkpoint(&record).await.unwrap();
    let loaded = store
        .load_checkpoint(&record.checkpoint_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.jobs, jobs);
    assert_eq!(loaded.options.parallelism, 3);
    assert_eq!(loaded.execution_id, "e1");
    assert!(store.load_checkpoint("ckpt-nope").await.unwrap().is_none());
}
