// src/dag/mod.rs

//! DAG representation and scheduling.
//!
//! - [`graph`] holds the job graph and the validation that runs before an
//!   execution is persisted.
//! - [`scheduler`] contains the per-execution state machine that decides
//!   which jobs are ready and blocks dependents of failed jobs.
//! - [`job_info`] provides job metadata and run states.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages run-state transitions.

pub mod graph;
pub mod job_info;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;

pub use graph::{DagGraph, validate_job_specs};
pub use job_info::RunState;
pub use scheduler::Scheduler;
pub use scheduler_step::SchedulerStep;
