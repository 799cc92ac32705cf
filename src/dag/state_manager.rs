// src/dag/state_manager.rs

//! Run-state transitions for the jobs of one execution.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::dag::DagGraph;
use crate::dag::job_info::{JobInfo, RunState};
use crate::types::JobId;

/// Mutating view over the job table of a [`Scheduler`](crate::dag::Scheduler).
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    jobs: &'a mut HashMap<JobId, JobInfo>,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a DagGraph, jobs: &'a mut HashMap<JobId, JobInfo>) -> Self {
        Self { graph, jobs }
    }

    /// Mark every transitive dependent of `failed_job` that has not started
    /// yet as `Blocked`.
    ///
    /// Returns the newly blocked jobs in declaration order.
    pub fn mark_dependents_blocked(&mut self, failed_job: &str) -> Vec<JobId> {
        let mut stack: Vec<JobId> = self.graph.dependents_of(failed_job).to_vec();
        let mut newly_blocked = Vec::new();

        while let Some(id) = stack.pop() {
            let Some(info) = self.jobs.get_mut(&id) else {
                warn!(job_id = %id, "node in DAG not present in job table");
                continue;
            };

            if info.run_state == RunState::Pending {
                info.run_state = RunState::Blocked;
                debug!(job_id = %info.id, upstream = %failed_job, "blocking job after upstream failure");
                newly_blocked.push(info.id.clone());
                stack.extend(self.graph.dependents_of(&id).iter().cloned());
            }
        }

        newly_blocked.sort_by_key(|id| self.graph.declaration_index(id));
        newly_blocked
    }
}

/// Read-only view used for dependency checks and readiness queries.
pub struct ReadOnlyStateManager<'a> {
    jobs: &'a HashMap<JobId, JobInfo>,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(jobs: &'a HashMap<JobId, JobInfo>) -> Self {
        Self { jobs }
    }

    /// A job is ready when every dependency has succeeded.
    pub fn deps_satisfied_for_info(&self, info: &JobInfo) -> bool {
        info.deps.iter().all(|dep| match self.jobs.get(dep) {
            Some(d) => d.run_state == RunState::Succeeded,
            None => {
                warn!(job_id = %info.id, dep = %dep, "dependency missing from job table");
                false
            }
        })
    }

    pub fn ready_jobs(&self) -> Vec<JobId> {
        let mut ready: Vec<&JobInfo> = self
            .jobs
            .values()
            .filter(|info| info.run_state == RunState::Pending && self.deps_satisfied_for_info(info))
            .collect();

        ready.sort_by_key(|info| info.dispatch_key());
        ready.into_iter().map(|info| info.id.clone()).collect()
    }
}
