// src/engine/mod.rs

//! Orchestration engine for pipedag.
//!
//! This module ties together:
//! - the per-execution DAG scheduler
//! - the job queue (where jobs actually run)
//! - the state store, lock manager and result cache
//! - the control loop that reacts to:
//!   - job outcomes coming back from the queue
//!   - pause requests
//!   - cancel requests
//!
//! The public entry point is [`Orchestrator`]; the per-execution event loop
//! lives in [`runtime`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::types::{ExecutionId, ExecutionStatus, JobId, JobResult};

pub mod cache;
pub mod orchestrator;
pub mod runtime;

pub use cache::{ResultCache, fingerprint};
pub use orchestrator::Orchestrator;

/// Called on the control loop when a job completes successfully.
pub type JobCompleteCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called on the control loop when a job fails, with its error message.
pub type JobFailCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Options for [`Orchestrator::execute`] and [`Orchestrator::resume`].
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Maximum concurrently dispatched jobs. `None` uses the configured
    /// default (or the checkpointed value on resume).
    pub parallelism: Option<usize>,
    pub enable_cache: bool,
    /// Use this id instead of a generated one.
    pub execution_id: Option<ExecutionId>,
    /// Initial execution metadata.
    pub metadata: Map<String, Value>,
    pub on_job_complete: Option<JobCompleteCallback>,
    pub on_job_fail: Option<JobFailCallback>,
}

impl ExecuteOptions {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn with_cache(mut self, enable: bool) -> Self {
        self.enable_cache = enable;
        self
    }

    pub fn with_execution_id(mut self, id: impl Into<ExecutionId>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn on_job_complete(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_job_complete = Some(Arc::new(f));
        self
    }

    pub fn on_job_fail(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_job_fail = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("parallelism", &self.parallelism)
            .field("enable_cache", &self.enable_cache)
            .field("execution_id", &self.execution_id)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// What `execute()` and `resume()` resolve with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    /// Results of every job that reached a terminal state.
    pub jobs: BTreeMap<JobId, JobResult>,
    /// Jobs that never ran because an upstream job failed, or because the
    /// execution stopped first. Declaration order.
    pub blocked: Vec<JobId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set when the execution was paused.
    pub checkpoint_id: Option<String>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Events flowing into an execution's control loop.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// The queue reported a final outcome (or the job timed out).
    JobFinished { job_id: JobId, result: JobResult },
    /// Stop dispatching, let in-flight jobs finish, then checkpoint.
    PauseRequested,
    /// Abort in-flight jobs and stop.
    CancelRequested,
}
