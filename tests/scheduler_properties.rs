// tests/scheduler_properties.rs

use std::collections::{BTreeSet, HashMap};

use proptest::prelude::*;

use pipedag::dag::{RunState, Scheduler, validate_job_specs};
use pipedag::types::JobSpec;

/// A random DAG: job `i` may only depend on jobs `0..i`, so it is acyclic by
/// construction.
#[derive(Debug, Clone)]
struct Plan {
    specs: Vec<JobSpec>,
    failing: BTreeSet<String>,
    parallelism: usize,
    /// Which running job finishes next (index modulo the running set).
    picks: Vec<usize>,
}

fn plan_strategy(max_jobs: usize) -> impl Strategy<Value = Plan> {
    (1..=max_jobs).prop_flat_map(|n| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
            proptest::collection::vec(0u8..=10, n),
            proptest::collection::vec(any::<bool>(), n),
            1usize..4,
            proptest::collection::vec(any::<usize>(), 4 * n),
        )
            .prop_map(move |(raw_deps, priorities, fails, parallelism, picks)| {
                let mut specs = Vec::with_capacity(n);
                let mut failing = BTreeSet::new();
                for i in 0..n {
                    let id = format!("job_{i}");
                    let deps: BTreeSet<usize> = if i == 0 {
                        BTreeSet::new()
                    } else {
                        raw_deps[i].iter().map(|d| d % i).collect()
                    };
                    let spec = deps.into_iter().fold(
                        JobSpec::new(id.clone(), "noop").with_priority(priorities[i]),
                        |spec, d| spec.depends_on(format!("job_{d}")),
                    );
                    // Roughly one job in four fails.
                    if fails[i] && i % 2 == 1 {
                        failing.insert(id);
                    }
                    specs.push(spec);
                }
                Plan {
                    specs,
                    failing,
                    parallelism,
                    picks,
                }
            })
    })
}

proptest! {
    #[test]
    fn scheduler_respects_dependencies_parallelism_and_priority(plan in plan_strategy(12)) {
        prop_assert!(validate_job_specs(&plan.specs).is_ok());

        let deps: HashMap<&str, Vec<&str>> = plan
            .specs
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
            .collect();
        let priority: HashMap<&str, u8> =
            plan.specs.iter().map(|s| (s.id.as_str(), s.priority)).collect();

        let mut scheduler = Scheduler::from_specs(&plan.specs);
        let mut running: Vec<String> = Vec::new();
        let mut picks = plan.picks.iter().cycle();
        let mut steps = 0;

        loop {
            let batch = scheduler.next_dispatchable(plan.parallelism);

            // Higher priority first within a batch.
            for pair in batch.windows(2) {
                prop_assert!(priority[pair[0].as_str()] >= priority[pair[1].as_str()]);
            }
            // Only jobs whose dependencies all succeeded are dispatched.
            for id in &batch {
                for dep in &deps[id.as_str()] {
                    prop_assert_eq!(scheduler.run_state_of(dep), Some(RunState::Succeeded));
                }
            }
            running.extend(batch);
            prop_assert!(running.len() <= plan.parallelism);
            prop_assert_eq!(running.len(), scheduler.running_count());

            if running.is_empty() {
                break;
            }

            let pick = picks.next().copied().unwrap_or(0) % running.len();
            let done = running.remove(pick);
            scheduler.handle_completion(&done, !plan.failing.contains(&done));

            steps += 1;
            prop_assert!(steps <= plan.specs.len(), "more completions than jobs");
        }

        prop_assert!(scheduler.is_finished());
        prop_assert!(scheduler.all_terminal());

        // Blocked exactly when some dependency did not succeed.
        for spec in &plan.specs {
            let state = scheduler.run_state_of(&spec.id);
            let upstream_ok = spec
                .depends_on
                .iter()
                .all(|d| scheduler.run_state_of(d) == Some(RunState::Succeeded));
            if upstream_ok {
                let expected = if plan.failing.contains(&spec.id) {
                    RunState::Failed
                } else {
                    RunState::Succeeded
                };
                prop_assert_eq!(state, Some(expected));
            } else {
                prop_assert_eq!(state, Some(RunState::Blocked));
            }
        }
    }

    #[test]
    fn restore_reproduces_completed_prefix(plan in plan_strategy(8), cut in 0usize..8) {
        let mut original = Scheduler::from_specs(&plan.specs);
        let mut state = pipedag::types::ExecutionState::new("exec", "wf", "wf");

        // Run jobs one at a time until `cut` have finished.
        let mut finished = 0;
        while finished < cut {
            let batch = original.next_dispatchable(1);
            let Some(id) = batch.into_iter().next() else { break };
            let success = !plan.failing.contains(&id);
            original.handle_completion(&id, success);
            if success {
                state.completed_jobs.insert(id);
            } else {
                state.failed_jobs.insert(id);
            }
            finished += 1;
        }

        let mut restored = Scheduler::from_specs(&plan.specs);
        restored.restore(&state);

        for spec in &plan.specs {
            prop_assert_eq!(restored.run_state_of(&spec.id), original.run_state_of(&spec.id));
        }
        prop_assert_eq!(restored.ready_jobs(), original.ready_jobs());
    }
}
