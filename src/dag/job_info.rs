// src/dag/job_info.rs

//! Per-job scheduling metadata and run state.

use crate::types::{JobId, JobSpec};

/// Scheduling state of a job within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Waiting for dependencies or for a free parallelism slot.
    Pending,
    /// Dispatched to the queue and not yet terminal.
    Running,
    Succeeded,
    Failed,
    /// Never scheduled because an upstream job failed.
    Blocked,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Blocked)
    }
}

/// Static job information needed for ordering, plus its run state.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: JobId,
    pub priority: u8,
    /// Position in the submitted list; lower wins among equal priorities.
    pub index: usize,
    /// Direct dependencies (deduplicated).
    pub deps: Vec<JobId>,
    pub run_state: RunState,
}

impl JobInfo {
    pub fn from_spec(spec: &JobSpec, index: usize, deps: Vec<JobId>) -> Self {
        Self {
            id: spec.id.clone(),
            priority: spec.priority,
            index,
            deps,
            run_state: RunState::Pending,
        }
    }

    /// Sort key for dispatch: higher priority first, then declaration order.
    pub fn dispatch_key(&self) -> (std::cmp::Reverse<u8>, usize) {
        (std::cmp::Reverse(self.priority), self.index)
    }
}
