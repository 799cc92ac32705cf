// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{EngineError, Result};
use crate::types::{JobId, JobSpec, MAX_PRIORITY};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    /// Position in the submitted job list; breaks priority ties.
    index: usize,
    /// Direct dependencies: jobs that must complete before this one can run.
    deps: Vec<JobId>,
    /// Direct dependents: jobs that depend on this one.
    dependents: Vec<JobId>,
}

/// In-memory job graph keyed by job id.
///
/// Acyclicity is checked by [`validate_job_specs`]; here we only keep
/// adjacency information for scheduling and diagnostics.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<JobId, DagNode>,
    order: Vec<JobId>,
}

impl DagGraph {
    /// Build a DAG from job specs that passed [`validate_job_specs`].
    ///
    /// Duplicate entries in `depends_on` are collapsed.
    pub fn from_specs(specs: &[JobSpec]) -> Self {
        let mut nodes: HashMap<JobId, DagNode> = HashMap::new();
        let mut order = Vec::with_capacity(specs.len());

        // First pass: create nodes with their dependency lists.
        for (index, spec) in specs.iter().enumerate() {
            let mut seen = HashSet::new();
            let deps = spec
                .depends_on
                .iter()
                .filter(|d| seen.insert(d.as_str()))
                .cloned()
                .collect();

            nodes.insert(
                spec.id.clone(),
                DagNode {
                    index,
                    deps,
                    dependents: Vec::new(),
                },
            );
            order.push(spec.id.clone());
        }

        // Second pass: populate dependents in declaration order.
        for job_id in &order {
            let deps = nodes
                .get(job_id)
                .map(|n| n.deps.clone())
                .unwrap_or_default();

            for dep in deps {
                if let Some(dep_node) = nodes.get_mut(&dep) {
                    dep_node.dependents.push(job_id.clone());
                }
            }
        }

        Self { nodes, order }
    }

    /// All job ids in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.nodes.contains_key(job_id)
    }

    /// Position of the job in the submitted list.
    pub fn declaration_index(&self, job_id: &str) -> Option<usize> {
        self.nodes.get(job_id).map(|n| n.index)
    }

    /// Immediate dependencies of a job.
    pub fn dependencies_of(&self, job_id: &str) -> &[JobId] {
        self.nodes
            .get(job_id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a job.
    pub fn dependents_of(&self, job_id: &str) -> &[JobId] {
        self.nodes
            .get(job_id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Jobs without dependencies, in declaration order.
    pub fn roots(&self) -> Vec<&str> {
        self.jobs()
            .filter(|id| self.dependencies_of(id).is_empty())
            .collect()
    }
}

/// Reject malformed job lists before anything is persisted.
///
/// Checks, in order: non-empty list, unique ids, priority range, no
/// self-dependency, no unknown dependency, no cycle.
pub fn validate_job_specs(specs: &[JobSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(EngineError::Validation(
            "a workflow must contain at least one job".to_string(),
        ));
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for spec in specs {
        if spec.id.trim().is_empty() {
            return Err(EngineError::Validation(
                "job ids must not be empty".to_string(),
            ));
        }
        if !ids.insert(spec.id.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate job id '{}'",
                spec.id
            )));
        }
        if spec.priority > MAX_PRIORITY {
            return Err(EngineError::Validation(format!(
                "job '{}' has priority {} (expected 0..={})",
                spec.id, spec.priority, MAX_PRIORITY
            )));
        }
    }

    for spec in specs {
        for dep in &spec.depends_on {
            if dep == &spec.id {
                return Err(EngineError::Validation(format!(
                    "job '{}' cannot depend on itself",
                    spec.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(EngineError::Validation(format!(
                    "job '{}' has unknown dependency '{}'",
                    spec.id, dep
                )));
            }
        }
    }

    // Edge direction: dep -> job.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for spec in specs {
        graph.add_node(spec.id.as_str());
    }
    for spec in specs {
        for dep in &spec.depends_on {
            graph.add_edge(dep.as_str(), spec.id.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(EngineError::DagCycle(format!(
            "cycle detected in job graph involving job '{}'",
            cycle.node_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, deps: &[&str]) -> JobSpec {
        deps.iter()
            .fold(JobSpec::new(id, "noop"), |spec, d| spec.depends_on(*d))
    }

    #[test]
    fn dependents_follow_declaration_order() {
        let specs = vec![
            job("a", &[]),
            job("c", &["a"]),
            job("b", &["a", "a"]),
        ];
        validate_job_specs(&specs).unwrap();
        let graph = DagGraph::from_specs(&specs);

        assert_eq!(graph.dependents_of("a"), ["c".to_string(), "b".to_string()]);
        assert_eq!(graph.dependencies_of("b"), ["a".to_string()]);
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.declaration_index("b"), Some(2));
    }

    #[test]
    fn rejects_cycles_duplicates_and_self_dependencies() {
        let cycle = vec![job("a", &["c"]), job("b", &["a"]), job("c", &["b"])];
        assert!(matches!(validate_job_specs(&cycle), Err(EngineError::DagCycle(_))));

        let dup = vec![job("a", &[]), job("a", &[])];
        assert!(matches!(validate_job_specs(&dup), Err(EngineError::Validation(m)) if m.contains("duplicate")));

        let selfdep = vec![job("a", &["a"])];
        assert!(matches!(validate_job_specs(&selfdep), Err(EngineError::Validation(m)) if m.contains("itself")));

        let too_high = vec![JobSpec::new("a", "noop").with_priority(11)];
        assert!(validate_job_specs(&too_high).unwrap_err().is_validation());

        assert!(validate_job_specs(&[]).is_err());
    }
}
