// src/state/checkpoint.rs

//! Checkpoint snapshots written on pause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ExecutionId, ExecutionState, JobSpec};

/// Execution options that must survive a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOptions {
    pub parallelism: usize,
    pub enable_cache: bool,
}

/// Everything needed to resume an execution without the caller re-supplying
/// the job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub execution_id: ExecutionId,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
    pub jobs: Vec<JobSpec>,
    pub options: CheckpointOptions,
}

impl CheckpointRecord {
    pub fn new(state: ExecutionState, jobs: Vec<JobSpec>, options: CheckpointOptions) -> Self {
        Self {
            checkpoint_id: format!("ckpt-{}", Uuid::new_v4()),
            execution_id: state.execution_id.clone(),
            created_at: Utc::now(),
            state,
            jobs,
            options,
        }
    }
}
