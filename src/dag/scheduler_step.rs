// src/dag/scheduler_step.rs

//! Result type for a single scheduler transition.

use crate::types::JobId;

/// What changed when the scheduler processed one job outcome.
///
/// Tests use this to step the DAG by hand and assert on each transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Jobs whose dependencies are now all satisfied, in dispatch order.
    pub newly_ready: Vec<JobId>,
    /// Jobs that can never run because this outcome was a failure
    /// (transitive dependents, excluding the failed job itself).
    pub newly_blocked: Vec<JobId>,
    /// Whether nothing is running and nothing else can be dispatched.
    pub finished: bool,
}
