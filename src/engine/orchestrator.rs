// src/engine/orchestrator.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{KeySpace, KvBackend};
use crate::config::EngineConfig;
use crate::config::model::OrchestratorSection;
use crate::dag::{Scheduler, validate_job_specs};
use crate::errors::{EngineError, Result};
use crate::exec::HandlerRegistry;
use crate::governor::ResourceGovernor;
use crate::lock::LockManager;
use crate::queue::JobQueue;
use crate::state::StateStore;
use crate::types::{ExecutionId, ExecutionState, ExecutionStatus, JobSpec};

use super::cache::ResultCache;
use super::runtime::{ExecutionRuntime, RunSettings};
use super::{ExecuteOptions, ExecutionResult, RuntimeEvent};

/// Capacity of each execution's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lock resource guarding multi-step writes to one execution.
pub(crate) fn execution_lock(execution_id: &str) -> String {
    format!("execution:{execution_id}")
}

/// Collaborators shared by the orchestrator handle and every running
/// execution loop.
pub(crate) struct Shared {
    pub(crate) state: StateStore,
    pub(crate) locks: LockManager,
    pub(crate) queue: JobQueue,
    pub(crate) cache: ResultCache,
    pub(crate) settings: OrchestratorSection,
    /// Lock owner name of this instance.
    pub(crate) instance_id: String,
    /// Control channels of executions driven by this instance.
    controls: Mutex<HashMap<ExecutionId, mpsc::Sender<RuntimeEvent>>>,
}

/// Entry point for running job graphs. Cheap to clone; clones share the same
/// set of running executions.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("instance_id", &self.inner.instance_id)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        locks: LockManager,
        queue: JobQueue,
        cache: ResultCache,
        settings: OrchestratorSection,
    ) -> Self {
        let instance_id = format!("orchestrator-{}", Uuid::new_v4());
        debug!(%instance_id, "orchestrator created");

        Self {
            inner: Arc::new(Shared {
                state,
                locks,
                queue,
                cache,
                settings,
                instance_id,
                controls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wire every component from configuration on top of one backend.
    ///
    /// Starts the queue dispatcher, so this must run inside a tokio runtime.
    pub fn from_config(config: &EngineConfig, backend: Arc<dyn KvBackend>, registry: HandlerRegistry) -> Self {
        let keys = KeySpace::new(config.backend.key_prefix.clone());
        let state = StateStore::new(Arc::clone(&backend), keys.clone(), &config.state);
        let locks = LockManager::new(Arc::clone(&backend), keys.clone(), config.lock.clone());
        let queue = JobQueue::start(
            Arc::clone(&backend),
            keys.clone(),
            registry,
            ResourceGovernor::new(&config.governor),
            &config.queue,
        );
        let cache = ResultCache::new(backend, keys, state.ttl());

        Self::new(state, locks, queue, cache, config.orchestrator.clone())
    }

    pub fn state_store(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Run a job graph to completion, pause or cancellation.
    ///
    /// `name` doubles as the workflow id that executions are indexed by.
    /// Every validation happens before any state is written.
    pub async fn execute(&self, name: &str, jobs: Vec<JobSpec>, options: ExecuteOptions) -> Result<ExecutionResult> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("workflow name must not be empty".to_string()));
        }
        let parallelism = self.resolve_parallelism(options.parallelism)?;
        validate_job_specs(&jobs)?;
        self.check_handlers(&jobs)?;

        let execution_id = options
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.inner.state.get_execution_state(&execution_id).await?.is_some() {
            return Err(EngineError::Validation(format!(
                "execution '{execution_id}' already exists"
            )));
        }

        let mut state = ExecutionState::new(execution_id.clone(), name, name);
        state.status = ExecutionStatus::Running;
        state.metadata = options.metadata.clone();
        self.inner.state.set_execution_state(&state).await?;

        info!(
            execution_id = %execution_id,
            workflow_id = name,
            jobs = jobs.len(),
            parallelism,
            "execution started"
        );

        let scheduler = Scheduler::from_specs(&jobs);
        let settings = RunSettings {
            parallelism,
            enable_cache: options.enable_cache,
        };
        self.drive(execution_id, jobs, scheduler, settings, options)
            .await
    }

    /// Continue a paused execution from its checkpoint.
    ///
    /// `options.parallelism` overrides the checkpointed value; the cache is
    /// on if it was on before or `options.enable_cache` is set.
    pub async fn resume(&self, checkpoint_id: &str, options: ExecuteOptions) -> Result<ExecutionResult> {
        let record = self
            .inner
            .state
            .load_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| EngineError::CheckpointNotFound(checkpoint_id.to_string()))?;

        let parallelism = match options.parallelism {
            Some(p) => self.resolve_parallelism(Some(p))?,
            None => record.options.parallelism.max(1),
        };
        self.check_handlers(&record.jobs)?;

        let execution_id = record.execution_id.clone();
        let shared = &self.inner;
        let restored = shared
            .locks
            .with_lock(&execution_lock(&execution_id), &shared.instance_id, || async {
                let mut state = match shared.state.get_execution_state(&execution_id).await? {
                    Some(state) if state.status == ExecutionStatus::Paused => state,
                    Some(state) => {
                        return Err(EngineError::Validation(format!(
                            "execution '{}' is {} and cannot be resumed",
                            execution_id, state.status
                        )));
                    }
                    // The live state expired; the checkpoint has everything.
                    None => record.state.clone(),
                };
                state.status = ExecutionStatus::Running;
                state.completed_at = None;
                shared.state.set_execution_state(&state).await?;
                Ok(state)
            })
            .await?;

        info!(
            execution_id = %execution_id,
            checkpoint_id,
            completed = restored.completed_jobs.len(),
            "execution resumed"
        );

        let mut scheduler = Scheduler::from_specs(&record.jobs);
        scheduler.restore(&restored);
        let settings = RunSettings {
            parallelism,
            enable_cache: options.enable_cache || record.options.enable_cache,
        };
        self.drive(execution_id, record.jobs, scheduler, settings, options)
            .await
    }

    /// Ask a running execution to pause. It stops dispatching, lets
    /// in-flight jobs finish, writes a checkpoint and its `execute()` call
    /// resolves with status `paused`.
    pub async fn pause(&self, execution_id: &str) -> Result<()> {
        let tx = self.control_channel(execution_id).await.ok_or_else(|| {
            EngineError::ExecutionNotFound(format!("{execution_id} is not running on this instance"))
        })?;
        tx.send(RuntimeEvent::PauseRequested)
            .await
            .map_err(|_| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(())
    }

    /// Cancel an execution.
    ///
    /// Running here: in-flight jobs are aborted and recorded as cancelled.
    /// Paused or pending (not running anywhere): the status is set to
    /// `cancelled` so it cannot be resumed. Returns `false` for executions
    /// that are already terminal or run on another instance.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        if let Some(tx) = self.control_channel(execution_id).await {
            if tx.send(RuntimeEvent::CancelRequested).await.is_ok() {
                return Ok(true);
            }
        }

        let state = self
            .inner
            .state
            .get_execution_state(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        match state.status {
            ExecutionStatus::Paused | ExecutionStatus::Pending => {
                self.inner
                    .state
                    .update_execution_status(execution_id, ExecutionStatus::Cancelled, None)
                    .await?;
                info!(execution_id, "idle execution cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionState>> {
        self.inner.state.get_execution_state(execution_id).await
    }

    pub async fn get_workflow_executions(&self, workflow_id: &str) -> Result<Vec<ExecutionState>> {
        self.inner.state.get_workflow_executions(workflow_id).await
    }

    /// Ids of executions currently driven by this instance.
    pub async fn running_executions(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<_> = self.inner.controls.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn drive(
        &self,
        execution_id: ExecutionId,
        jobs: Vec<JobSpec>,
        scheduler: Scheduler,
        settings: RunSettings,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner
            .controls
            .lock()
            .await
            .insert(execution_id.clone(), tx.clone());

        let runtime = ExecutionRuntime::new(
            Arc::clone(&self.inner),
            execution_id.clone(),
            jobs,
            scheduler,
            settings,
            options.on_job_complete,
            options.on_job_fail,
        );
        let outcome = runtime.run(tx, rx).await;

        self.inner.controls.lock().await.remove(&execution_id);
        outcome
    }

    async fn control_channel(&self, execution_id: &str) -> Option<mpsc::Sender<RuntimeEvent>> {
        self.inner.controls.lock().await.get(execution_id).cloned()
    }

    fn resolve_parallelism(&self, requested: Option<usize>) -> Result<usize> {
        match requested {
            Some(0) => Err(EngineError::Validation("parallelism must be >= 1".to_string())),
            Some(p) => Ok(p),
            None => Ok(self.inner.settings.default_parallelism.max(1)),
        }
    }

    fn check_handlers(&self, jobs: &[JobSpec]) -> Result<()> {
        let registry = self.inner.queue.registry();
        match jobs.iter().find(|job| !registry.contains(&job.job_type)) {
            Some(job) => Err(EngineError::Validation(format!(
                "job '{}' has type '{}' with no registered handler",
                job.id, job.job_type
            ))),
            None => Ok(()),
        }
    }
}
