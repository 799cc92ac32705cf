// src/dag/scheduler.rs

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::dag::graph::DagGraph;
use crate::dag::job_info::{JobInfo, RunState};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::{ReadOnlyStateManager, StateManager};
use crate::types::{ExecutionState, JobId, JobSpec};

/// Scheduler holds the immutable DAG plus the mutable per-execution state.
///
/// It is pure: it never talks to the backend or the queue. The orchestrator
/// feeds it outcomes and asks it what to dispatch next. It is responsible
/// for:
/// - deciding which pending jobs are ready (all dependencies succeeded)
/// - ordering ready jobs by priority, then declaration order
/// - blocking dependents when a job fails
/// - telling the caller when nothing else can progress
#[derive(Debug, Clone)]
pub struct Scheduler {
    graph: DagGraph,
    jobs: HashMap<JobId, JobInfo>,
}

impl Scheduler {
    /// Construct a scheduler from job specs that passed
    /// [`validate_job_specs`](crate::dag::validate_job_specs).
    pub fn from_specs(specs: &[JobSpec]) -> Self {
        let graph = DagGraph::from_specs(specs);

        let jobs = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let deps = graph.dependencies_of(&spec.id).to_vec();
                (spec.id.clone(), JobInfo::from_spec(spec, index, deps))
            })
            .collect();

        Self { graph, jobs }
    }

    /// Rebuild run states from a persisted execution.
    ///
    /// Completed and failed jobs keep their outcome and dependents of failed
    /// jobs are blocked again. Jobs that were in flight when the state was
    /// written go back to `Pending` so they get dispatched again.
    pub fn restore(&mut self, state: &ExecutionState) {
        for info in self.jobs.values_mut() {
            info.run_state = if state.completed_jobs.contains(&info.id) {
                RunState::Succeeded
            } else if state.failed_jobs.contains(&info.id) {
                RunState::Failed
            } else {
                RunState::Pending
            };
        }

        for failed in &state.failed_jobs {
            let mut manager = StateManager::new(&self.graph, &mut self.jobs);
            manager.mark_dependents_blocked(failed);
        }

        debug!(
            execution_id = %state.execution_id,
            completed = state.completed_jobs.len(),
            failed = state.failed_jobs.len(),
            "scheduler restored from persisted state"
        );
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.graph.jobs()
    }

    pub fn run_state_of(&self, job_id: &str) -> Option<RunState> {
        self.jobs.get(job_id).map(|info| info.run_state)
    }

    pub fn running_count(&self) -> usize {
        self.count(RunState::Running)
    }

    fn count(&self, state: RunState) -> usize {
        self.jobs.values().filter(|i| i.run_state == state).count()
    }

    /// Ready jobs in dispatch order, without changing any state.
    pub fn ready_jobs(&self) -> Vec<JobId> {
        ReadOnlyStateManager::new(&self.jobs).ready_jobs()
    }

    /// Pick up to `parallelism - running` ready jobs and mark them `Running`.
    pub fn next_dispatchable(&mut self, parallelism: usize) -> Vec<JobId> {
        let free = parallelism.saturating_sub(self.running_count());
        let picked: Vec<JobId> = self.ready_jobs().into_iter().take(free).collect();

        for id in &picked {
            self.mark_running(id);
        }
        picked
    }

    /// Mark a single ready job as dispatched.
    pub fn mark_running(&mut self, job_id: &str) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(info) if info.run_state == RunState::Pending => {
                info.run_state = RunState::Running;
                debug!(job_id, "dependencies satisfied; marking Running");
                true
            }
            _ => false,
        }
    }

    /// Undo a dispatch that did not happen (e.g. the persisted state refused
    /// it).
    pub fn mark_pending(&mut self, job_id: &str) {
        if let Some(info) = self.jobs.get_mut(job_id) {
            if info.run_state == RunState::Running {
                info.run_state = RunState::Pending;
            }
        }
    }

    /// Record a terminal outcome for a job.
    pub fn handle_completion(&mut self, job_id: &str, success: bool) -> SchedulerStep {
        let mut newly_blocked = Vec::new();

        match self.jobs.get_mut(job_id) {
            Some(info) if info.run_state.is_terminal() => {
                warn!(job_id, state = ?info.run_state, "duplicate completion; ignoring");
            }
            Some(info) if success => {
                info.run_state = RunState::Succeeded;
                debug!(job_id, "job succeeded");
            }
            Some(info) => {
                info.run_state = RunState::Failed;
                warn!(job_id, "job failed; blocking dependents");
                let mut manager = StateManager::new(&self.graph, &mut self.jobs);
                newly_blocked = manager.mark_dependents_blocked(job_id);
            }
            None => warn!(job_id, "completion for unknown job; ignoring"),
        }

        let newly_ready = self.ready_jobs();
        let finished = self.is_finished();
        if finished {
            info!(
                succeeded = self.count(RunState::Succeeded),
                failed = self.count(RunState::Failed),
                blocked = self.count(RunState::Blocked),
                "scheduler: nothing left to run"
            );
        }

        SchedulerStep {
            newly_ready,
            newly_blocked,
            finished,
        }
    }

    /// Nothing is running and nothing can be dispatched.
    pub fn is_finished(&self) -> bool {
        self.running_count() == 0 && self.ready_jobs().is_empty()
    }

    /// Every job reached a terminal run state.
    pub fn all_terminal(&self) -> bool {
        self.jobs.values().all(|info| info.run_state.is_terminal())
    }

    pub fn all_succeeded(&self) -> bool {
        self.jobs.values().all(|info| info.run_state == RunState::Succeeded)
    }

    /// Jobs that never ran: blocked by a failure, or still pending when the
    /// execution stopped. Declaration order.
    pub fn blocked_jobs(&self) -> Vec<JobId> {
        self.graph
            .jobs()
            .filter(|id| {
                matches!(
                    self.run_state_of(id),
                    Some(RunState::Blocked) | Some(RunState::Pending)
                )
            })
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, deps: &[&str], priority: u8) -> JobSpec {
        deps.iter().fold(JobSpec::new(id, "noop").with_priority(priority), |s, d| {
            s.depends_on(*d)
        })
    }

    #[test]
    fn dispatches_by_priority_then_declaration_order() {
        let mut scheduler = Scheduler::from_specs(&[
            job("low", &[], 1),
            job("high", &[], 9),
            job("mid-a", &[], 5),
            job("mid-b", &[], 5),
        ]);

        assert_eq!(scheduler.next_dispatchable(3), vec!["high", "mid-a", "mid-b"]);
        assert_eq!(scheduler.next_dispatchable(3), Vec::<JobId>::new());
        scheduler.handle_completion("high", true);
        assert_eq!(scheduler.next_dispatchable(3), vec!["low"]);
    }

    #[test]
    fn failure_blocks_transitive_dependents_only() {
        let mut scheduler = Scheduler::from_specs(&[
            job("a", &[], 0),
            job("b", &["a"], 0),
            job("c", &["b"], 0),
            job("d", &[], 0),
        ]);

        assert_eq!(scheduler.next_dispatchable(4), vec!["a", "d"]);
        let step = scheduler.handle_completion("a", false);
        assert_eq!(step.newly_blocked, vec!["b", "c"]);
        assert!(!step.finished);

        let step = scheduler.handle_completion("d", true);
        assert!(step.finished);
        assert_eq!(scheduler.blocked_jobs(), vec!["b", "c"]);
        assert!(scheduler.all_terminal());
        assert!(!scheduler.all_succeeded());
    }

    #[test]
    fn restore_requeues_in_flight_jobs() {
        let specs = [job("a", &[], 0), job("b", &["a"], 0), job("c", &["a"], 0)];
        let mut state = ExecutionState::new("e1", "wf", "wf");
        state.completed_jobs.insert("a".into());
        state.current_jobs.insert("b".into());

        let mut scheduler = Scheduler::from_specs(&specs);
        scheduler.restore(&state);

        assert_eq!(scheduler.run_state_of("a"), Some(RunState::Succeeded));
        assert_eq!(scheduler.ready_jobs(), vec!["b", "c"]);
    }
}
