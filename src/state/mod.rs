// src/state/mod.rs

//! Durable execution state.
//!
//! Each execution is one JSON [`ExecutionState`] under
//! `{prefix}:execution:{id}`. Every structural mutation is a single
//! read-modify-write through [`compare_and_update`], so concurrent
//! orchestrator instances never lose each other's updates and a job can only
//! be completed once.
//!
//! Executions are also listed in a per-workflow index key, which is what
//! [`StateStore::get_workflow_executions`] reads. Every key carries the state
//! TTL, refreshed on every write.

pub mod checkpoint;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::backend::{KeySpace, KvBackend, Update, compare_and_update};
use crate::config::model::StateSection;
use crate::errors::{BackendError, BackendResult, Result};
use crate::types::{ExecutionState, ExecutionStatus, JobResult};

pub use checkpoint::{CheckpointOptions, CheckpointRecord};

#[derive(Debug, Clone)]
pub struct StateStore {
    backend: Arc<dyn KvBackend>,
    keys: KeySpace,
    ttl: Duration,
}

impl StateStore {
    pub fn new(backend: Arc<dyn KvBackend>, keys: KeySpace, settings: &StateSection) -> Self {
        Self {
            backend,
            keys,
            ttl: Duration::from_secs(settings.ttl_secs),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write the whole state unconditionally and make sure the execution is
    /// listed in its workflow index.
    pub async fn set_execution_state(&self, state: &ExecutionState) -> Result<()> {
        let raw = serde_json::to_string(state).map_err(BackendError::from)?;
        self.backend
            .set(&self.keys.execution(&state.execution_id), &raw, Some(self.ttl))
            .await?;
        self.index_execution(&state.workflow_id, &state.execution_id)
            .await?;

        debug!(execution_id = %state.execution_id, status = %state.status, "execution state written");
        Ok(())
    }

    pub async fn get_execution_state(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        let raw = self.backend.get(&self.keys.execution(execution_id)).await?;
        Ok(parse_state(raw.as_deref())?)
    }

    /// Set the status and merge `metadata` into the stored metadata.
    ///
    /// Writing a terminal status also stamps `completedAt` (once).
    pub async fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        metadata: Option<Map<String, Value>>,
    ) -> Result<bool> {
        let updated = self
            .mutate(execution_id, |state| {
                state.status = status;
                if status.is_terminal() && state.completed_at.is_none() {
                    state.completed_at = Some(Utc::now());
                }
                if let Some(extra) = &metadata {
                    state
                        .metadata
                        .extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                true
            })
            .await?;

        if updated {
            debug!(execution_id, %status, "execution status updated");
        }
        Ok(updated)
    }

    /// Record that `job_id` was dispatched.
    ///
    /// Returns `false` if the execution is missing or the job already reached
    /// a terminal set.
    pub async fn add_current_job(&self, execution_id: &str, job_id: &str) -> Result<bool> {
        self.mutate(execution_id, |state| {
            if state.is_job_terminal(job_id) {
                return false;
            }
            state.current_jobs.insert(job_id.to_string());
            true
        })
        .await
    }

    /// Move a job from `currentJobs` to `completedJobs`/`failedJobs` and store
    /// its result.
    ///
    /// Only the first completion of a dispatched job lands; any later call
    /// (from this or another instance) returns `false`.
    pub async fn complete_job(&self, execution_id: &str, job_id: &str, result: &JobResult) -> Result<bool> {
        let completed = self
            .mutate(execution_id, |state| {
                if !state.current_jobs.remove(job_id) {
                    return false;
                }
                if result.success {
                    state.completed_jobs.insert(job_id.to_string());
                } else {
                    state.failed_jobs.insert(job_id.to_string());
                }
                state.job_results.insert(job_id.to_string(), result.clone());
                true
            })
            .await?;

        if completed {
            debug!(execution_id, job_id, success = result.success, "job completion recorded");
        } else {
            debug!(execution_id, job_id, "job completion ignored: not in currentJobs");
        }
        Ok(completed)
    }

    pub async fn set_checkpoint(&self, execution_id: &str, checkpoint_id: &str) -> Result<bool> {
        self.mutate(execution_id, |state| {
            state.checkpoint_id = Some(checkpoint_id.to_string());
            true
        })
        .await
    }

    /// All live executions of a workflow, oldest first.
    ///
    /// Index entries whose state has expired are dropped from the index.
    pub async fn get_workflow_executions(&self, workflow_id: &str) -> Result<Vec<ExecutionState>> {
        let index_key = self.keys.workflow_index(workflow_id);
        let raw = self.backend.get(&index_key).await?;
        let ids = parse_index(raw.as_deref())?;

        let mut states = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            match self.get_execution_state(&id).await? {
                Some(state) => states.push(state),
                None => stale.push(id),
            }
        }

        if !stale.is_empty() {
            debug!(workflow_id, pruned = stale.len(), "pruning expired executions from workflow index");
            self.unindex_executions(workflow_id, &stale).await?;
        }

        states.sort_by_key(|s| s.started_at);
        Ok(states)
    }

    /// Remove an execution. Returns `false` if it did not exist.
    pub async fn delete_execution_state(&self, execution_id: &str) -> Result<bool> {
        let Some(state) = self.get_execution_state(execution_id).await? else {
            return Ok(false);
        };

        let deleted = self
            .backend
            .delete(&self.keys.execution(execution_id))
            .await?;
        self.unindex_executions(&state.workflow_id, &[execution_id.to_string()])
            .await?;

        debug!(execution_id, "execution state deleted");
        Ok(deleted)
    }

    /// Backend round-trip; errors are logged and reported as unhealthy.
    pub async fn is_healthy(&self) -> bool {
        match self.backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "state store health check failed");
                false
            }
        }
    }

    /// Persist a checkpoint snapshot with the state TTL.
    pub async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()> {
        let raw = serde_json::to_string(record).map_err(BackendError::from)?;
        self.backend
            .set(&self.keys.checkpoint(&record.checkpoint_id), &raw, Some(self.ttl))
            .await?;
        debug!(checkpoint_id = %record.checkpoint_id, execution_id = %record.execution_id, "checkpoint saved");
        Ok(())
    }

    pub async fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        let raw = self.backend.get(&self.keys.checkpoint(checkpoint_id)).await?;
        let record = raw
            .as_deref()
            .map(serde_json::from_str::<CheckpointRecord>)
            .transpose()
            .map_err(BackendError::from)?;
        Ok(record)
    }

    /// Atomic read-modify-write of one execution.
    ///
    /// `f` returns whether it changed anything; `false` turns into a no-op.
    /// Missing executions yield `Ok(false)`. A write also refreshes the
    /// workflow index, so a listed execution never outlives its listing.
    async fn mutate<F>(&self, execution_id: &str, mut f: F) -> Result<bool>
    where
        F: FnMut(&mut ExecutionState) -> bool + Send,
    {
        let mut workflow_id = None;
        let changed = compare_and_update(
            self.backend.as_ref(),
            &self.keys.execution(execution_id),
            Some(self.ttl),
            |current| {
                let Some(mut state) = parse_state(current)? else {
                    return Ok(Update::Keep);
                };
                if !f(&mut state) {
                    return Ok(Update::Keep);
                }
                let raw = serde_json::to_string(&state)?;
                workflow_id = Some(state.workflow_id);
                Ok(Update::Put(raw))
            },
        )
        .await?;

        if let (true, Some(workflow_id)) = (changed, workflow_id) {
            self.index_execution(&workflow_id, execution_id).await?;
        }
        Ok(changed)
    }

    async fn index_execution(&self, workflow_id: &str, execution_id: &str) -> BackendResult<bool> {
        compare_and_update(
            self.backend.as_ref(),
            &self.keys.workflow_index(workflow_id),
            Some(self.ttl),
            |current| {
                let mut ids = parse_index(current)?;
                if !ids.iter().any(|id| id == execution_id) {
                    ids.push(execution_id.to_string());
                }
                // Always rewrite so the TTL is refreshed.
                Ok(Update::Put(serde_json::to_string(&ids)?))
            },
        )
        .await
    }

    async fn unindex_executions(&self, workflow_id: &str, remove: &[String]) -> BackendResult<bool> {
        compare_and_update(
            self.backend.as_ref(),
            &self.keys.workflow_index(workflow_id),
            Some(self.ttl),
            |current| {
                let mut ids = parse_index(current)?;
                let before = ids.len();
                ids.retain(|id| !remove.contains(id));
                if ids.len() == before {
                    Ok(Update::Keep)
                } else if ids.is_empty() {
                    Ok(Update::Delete)
                } else {
                    Ok(Update::Put(serde_json::to_string(&ids)?))
                }
            },
        )
        .await
    }
}

fn parse_state(raw: Option<&str>) -> BackendResult<Option<ExecutionState>> {
    Ok(raw.map(serde_json::from_str::<ExecutionState>).transpose()?)
}

fn parse_index(raw: Option<&str>) -> BackendResult<Vec<String>> {
    Ok(raw
        .map(serde_json::from_str::<Vec<String>>)
        .transpose()?
        .unwrap_or_default())
}
