// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dag::{RunState, Scheduler};
use crate::errors::{EngineError, Result};
use crate::queue::{JobQueue, JobSubmission};
use crate::state::{CheckpointOptions, CheckpointRecord};
use crate::types::{ErrorCategory, ExecutionId, ExecutionState, ExecutionStatus, JobId, JobResult, JobSpec};

use super::orchestrator::{Shared, execution_lock};
use super::{ExecutionResult, JobCompleteCallback, JobFailCallback, RuntimeEvent};

/// Per-execution settings fixed at start (or restored from a checkpoint).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunSettings {
    pub parallelism: usize,
    pub enable_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Running,
    /// No new dispatches; checkpoint once in-flight jobs are done.
    Pausing,
    /// In-flight jobs were aborted; stop once they report back.
    Cancelling,
}

/// How a single dispatch attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Handed to the job queue.
    Queued,
    /// Completed without the queue (cache hit, or already terminal in the
    /// persisted state).
    Inline,
    /// Persisted state disagrees with the scheduler; left pending.
    Deferred,
}

/// Drives one execution: the scheduler decides, this shell does the IO.
///
/// The loop consumes [`RuntimeEvent`]s (job outcomes from watcher tasks,
/// pause and cancel requests), persists every transition through the state
/// store, and dispatches newly ready jobs to the queue.
pub(crate) struct ExecutionRuntime {
    shared: Arc<Shared>,
    execution_id: ExecutionId,
    jobs: Vec<JobSpec>,
    index: HashMap<JobId, usize>,
    scheduler: Scheduler,
    settings: RunSettings,
    on_job_complete: Option<JobCompleteCallback>,
    on_job_fail: Option<JobFailCallback>,
    /// Job id -> queue job id.
    in_flight: HashMap<JobId, String>,
    mode: RunMode,
}

impl fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("execution_id", &self.execution_id)
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl ExecutionRuntime {
    pub(crate) fn new(
        shared: Arc<Shared>,
        execution_id: ExecutionId,
        jobs: Vec<JobSpec>,
        scheduler: Scheduler,
        settings: RunSettings,
        on_job_complete: Option<JobCompleteCallback>,
        on_job_fail: Option<JobFailCallback>,
    ) -> Self {
        let index = jobs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.id.clone(), i))
            .collect();

        Self {
            shared,
            execution_id,
            jobs,
            index,
            scheduler,
            settings,
            on_job_complete,
            on_job_fail,
            in_flight: HashMap::new(),
            mode: RunMode::Running,
        }
    }

    /// Main event loop.
    ///
    /// Returns once nothing is in flight and either nothing else can run or
    /// a pause/cancel stopped dispatching.
    pub(crate) async fn run(
        mut self,
        tx: mpsc::Sender<RuntimeEvent>,
        mut rx: mpsc::Receiver<RuntimeEvent>,
    ) -> Result<ExecutionResult> {
        info!(
            execution_id = %self.execution_id,
            parallelism = self.settings.parallelism,
            enable_cache = self.settings.enable_cache,
            "execution loop started"
        );

        match self.event_loop(&tx, &mut rx).await {
            Ok(()) => self.finish().await,
            Err(e @ EngineError::Backend(_)) => {
                // Unreachable backend: whatever was persisted still stands,
                // so leave the execution resumable instead of failing it.
                warn!(execution_id = %self.execution_id, error = %e, "backend error; pausing execution");
                self.abort_in_flight(ErrorCategory::Cancelled).await;
                match self.write_checkpoint().await {
                    Ok(checkpoint_id) => {
                        info!(execution_id = %self.execution_id, %checkpoint_id, "execution paused after backend error");
                    }
                    Err(checkpoint_err) => {
                        warn!(execution_id = %self.execution_id, error = %checkpoint_err, "could not checkpoint after backend error");
                    }
                }
                Err(e)
            }
            Err(e) => {
                warn!(execution_id = %self.execution_id, error = %e, "execution loop failed; aborting in-flight jobs");
                self.abort_in_flight(ErrorCategory::Cancelled).await;

                let mut metadata = Map::new();
                metadata.insert("error".to_string(), Value::String(e.to_string()));
                if let Err(mark_err) = self
                    .shared
                    .state
                    .update_execution_status(&self.execution_id, ExecutionStatus::Failed, Some(metadata))
                    .await
                {
                    warn!(execution_id = %self.execution_id, error = %mark_err, "could not mark execution failed");
                }
                Err(e)
            }
        }
    }

    async fn event_loop(
        &mut self,
        tx: &mpsc::Sender<RuntimeEvent>,
        rx: &mut mpsc::Receiver<RuntimeEvent>,
    ) -> Result<()> {
        self.dispatch_ready(tx).await?;

        while !self.in_flight.is_empty() {
            let Some(event) = rx.recv().await else {
                info!("runtime event channel closed; exiting");
                break;
            };

            debug!(execution_id = %self.execution_id, ?event, "runtime received event");

            match event {
                RuntimeEvent::JobFinished { job_id, result } => {
                    if self.in_flight.remove(&job_id).is_none() {
                        warn!(execution_id = %self.execution_id, job_id = %job_id, "outcome for a job that is not in flight; ignoring");
                        continue;
                    }
                    self.record_outcome(&job_id, result).await?;
                    if self.mode == RunMode::Running {
                        self.dispatch_ready(tx).await?;
                    }
                }
                RuntimeEvent::PauseRequested => {
                    if self.mode == RunMode::Running {
                        info!(
                            execution_id = %self.execution_id,
                            in_flight = self.in_flight.len(),
                            "pause requested; waiting for in-flight jobs"
                        );
                        self.mode = RunMode::Pausing;
                    }
                }
                RuntimeEvent::CancelRequested => {
                    if self.mode != RunMode::Cancelling {
                        info!(
                            execution_id = %self.execution_id,
                            in_flight = self.in_flight.len(),
                            "cancel requested; aborting in-flight jobs"
                        );
                        self.mode = RunMode::Cancelling;
                        self.abort_in_flight(ErrorCategory::Cancelled).await;
                    }
                }
            }
        }

        // Requests that arrived while nothing was in flight still count.
        while let Ok(event) = rx.try_recv() {
            match event {
                RuntimeEvent::PauseRequested if self.mode == RunMode::Running => self.mode = RunMode::Pausing,
                RuntimeEvent::CancelRequested => self.mode = RunMode::Cancelling,
                _ => {}
            }
        }

        Ok(())
    }

    /// Dispatch ready jobs until the parallelism budget is used up.
    async fn dispatch_ready(&mut self, tx: &mpsc::Sender<RuntimeEvent>) -> Result<()> {
        loop {
            let picked = self.scheduler.next_dispatchable(self.settings.parallelism);
            if picked.is_empty() {
                return Ok(());
            }

            // Dependencies are confirmed against a fresh snapshot, not only
            // against local scheduler state.
            let snapshot = self.load_state().await?;
            let mut inline = false;
            for job_id in picked {
                inline |= self.dispatch_one(&job_id, &snapshot, tx).await? == Dispatch::Inline;
            }

            // Inline completions may have unlocked more jobs.
            if !inline {
                return Ok(());
            }
        }
    }

    async fn dispatch_one(
        &mut self,
        job_id: &str,
        snapshot: &ExecutionState,
        tx: &mpsc::Sender<RuntimeEvent>,
    ) -> Result<Dispatch> {
        let spec = self.spec(job_id)?.clone();

        if let Some(missing) = spec
            .depends_on
            .iter()
            .find(|dep| !snapshot.completed_jobs.contains(*dep))
        {
            warn!(
                execution_id = %self.execution_id,
                job_id,
                dependency = %missing,
                "dependency not completed in persisted state; deferring job"
            );
            self.scheduler.mark_pending(job_id);
            return Ok(Dispatch::Deferred);
        }

        if snapshot.is_job_terminal(job_id) {
            return Ok(self.adopt_persisted(job_id, snapshot));
        }

        if !self
            .shared
            .state
            .add_current_job(&self.execution_id, job_id)
            .await?
        {
            // Another writer finished the job in the meantime.
            let fresh = self.load_state().await?;
            return Ok(self.adopt_persisted(job_id, &fresh));
        }

        if self.settings.enable_cache {
            if let Some(hit) = self.shared.cache.lookup(&spec).await? {
                info!(execution_id = %self.execution_id, job_id, "job completed from result cache");
                self.record_outcome(job_id, hit).await?;
                return Ok(Dispatch::Inline);
            }
        }

        let queue_job_id = self
            .shared
            .queue
            .submit_job(JobSubmission::new(self.execution_id.clone(), spec.clone()))
            .await?;

        let Some(outcome_rx) = self.shared.queue.wait(&queue_job_id).await? else {
            let result = JobResult::failed(job_id, ErrorCategory::Cancelled, "job vanished from the queue", Utc::now());
            self.record_outcome(job_id, result).await?;
            return Ok(Dispatch::Inline);
        };

        info!(
            execution_id = %self.execution_id,
            job_id,
            queue_job_id = %queue_job_id,
            priority = spec.priority,
            "job dispatched"
        );

        spawn_watcher(
            self.shared.queue.clone(),
            tx.clone(),
            job_id.to_string(),
            queue_job_id.clone(),
            outcome_rx,
            spec.timeout_ms.map(Duration::from_millis),
        );
        self.in_flight.insert(job_id.to_string(), queue_job_id);
        Ok(Dispatch::Queued)
    }

    /// Follow an outcome some other writer already persisted.
    fn adopt_persisted(&mut self, job_id: &str, snapshot: &ExecutionState) -> Dispatch {
        match snapshot.job_results.get(job_id) {
            Some(result) if snapshot.is_job_terminal(job_id) => {
                debug!(execution_id = %self.execution_id, job_id, success = result.success, "adopting persisted job outcome");
                self.scheduler.handle_completion(job_id, result.success);
                Dispatch::Inline
            }
            _ => {
                self.scheduler.mark_pending(job_id);
                Dispatch::Deferred
            }
        }
    }

    /// Persist a terminal outcome, fire callbacks, advance the scheduler.
    async fn record_outcome(&mut self, job_id: &str, result: JobResult) -> Result<()> {
        let recorded = self
            .shared
            .state
            .complete_job(&self.execution_id, job_id, &result)
            .await?;

        if !recorded {
            let snapshot = self.load_state().await?;
            let success = snapshot
                .job_results
                .get(job_id)
                .map(|r| r.success)
                .unwrap_or(result.success);
            debug!(execution_id = %self.execution_id, job_id, success, "job outcome already recorded elsewhere");
            self.scheduler.handle_completion(job_id, success);
            return Ok(());
        }

        if result.success {
            info!(
                execution_id = %self.execution_id,
                job_id,
                attempts = result.attempts,
                cached = result.cached,
                execution_time_ms = result.execution_time_ms,
                "job completed"
            );
            if self.settings.enable_cache {
                let spec = self.spec(job_id)?;
                if let Err(e) = self.shared.cache.store(spec, &result).await {
                    warn!(job_id, error = %e, "failed to write result cache");
                }
            }
            if let Some(cb) = &self.on_job_complete {
                cb(job_id);
            }
        } else {
            let error = result.error.as_deref().unwrap_or("unknown error");
            warn!(
                execution_id = %self.execution_id,
                job_id,
                category = ?result.error_category,
                attempts = result.attempts,
                error,
                "job failed"
            );
            if let Some(cb) = &self.on_job_fail {
                cb(job_id, error);
            }
        }

        let step = self.scheduler.handle_completion(job_id, result.success);
        if !step.newly_blocked.is_empty() {
            info!(
                execution_id = %self.execution_id,
                job_id,
                blocked = ?step.newly_blocked,
                "dependents blocked by failure"
            );
        }
        Ok(())
    }

    async fn abort_in_flight(&self, category: ErrorCategory) {
        for (job_id, queue_job_id) in &self.in_flight {
            match self.shared.queue.abort(queue_job_id, category).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job_id, queue_job_id = %queue_job_id, "abort found nothing to stop");
                }
                Err(e) => {
                    warn!(job_id = %job_id, queue_job_id = %queue_job_id, error = %e, "abort failed");
                }
            }
        }
    }

    /// Write the terminal (or paused) status and build the result.
    async fn finish(self) -> Result<ExecutionResult> {
        let (status, checkpoint_id) = match self.mode {
            RunMode::Cancelling => (ExecutionStatus::Cancelled, None),
            RunMode::Pausing if !self.scheduler.all_terminal() => {
                (ExecutionStatus::Paused, Some(self.write_checkpoint().await?))
            }
            _ if self.scheduler.all_succeeded() => (ExecutionStatus::Completed, None),
            _ => (ExecutionStatus::Failed, None),
        };

        if status != ExecutionStatus::Paused {
            self.shared
                .state
                .update_execution_status(&self.execution_id, status, None)
                .await?;
        }

        let state = self.load_state().await?;
        let blocked = if status == ExecutionStatus::Paused {
            self.jobs_in(RunState::Blocked)
        } else {
            self.scheduler.blocked_jobs()
        };

        info!(
            execution_id = %self.execution_id,
            %status,
            completed = state.completed_jobs.len(),
            failed = state.failed_jobs.len(),
            blocked = blocked.len(),
            "execution finished"
        );

        Ok(ExecutionResult {
            execution_id: state.execution_id,
            status,
            jobs: state.job_results,
            blocked,
            started_at: state.started_at,
            completed_at: state.completed_at,
            checkpoint_id: checkpoint_id.or(state.checkpoint_id).filter(|_| status == ExecutionStatus::Paused),
        })
    }

    /// Snapshot state and options under the execution lock, then mark the
    /// execution paused.
    async fn write_checkpoint(&self) -> Result<String> {
        let shared = &self.shared;
        let execution_id = &self.execution_id;

        shared
            .locks
            .with_lock(&execution_lock(execution_id), &shared.instance_id, || async {
                let mut state = shared
                    .state
                    .get_execution_state(execution_id)
                    .await?
                    .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.clone()))?;
                state.status = ExecutionStatus::Paused;

                let options = CheckpointOptions {
                    parallelism: self.settings.parallelism,
                    enable_cache: self.settings.enable_cache,
                };
                let mut record = CheckpointRecord::new(state, self.jobs.clone(), options);
                record.state.checkpoint_id = Some(record.checkpoint_id.clone());

                shared.state.save_checkpoint(&record).await?;
                shared
                    .state
                    .set_checkpoint(execution_id, &record.checkpoint_id)
                    .await?;
                shared
                    .state
                    .update_execution_status(execution_id, ExecutionStatus::Paused, None)
                    .await?;

                info!(execution_id = %execution_id, checkpoint_id = %record.checkpoint_id, "execution paused");
                Ok(record.checkpoint_id)
            })
            .await
    }

    async fn load_state(&self) -> Result<ExecutionState> {
        self.shared
            .state
            .get_execution_state(&self.execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(self.execution_id.clone()))
    }

    fn spec(&self, job_id: &str) -> Result<&JobSpec> {
        self.index
            .get(job_id)
            .and_then(|&i| self.jobs.get(i))
            .ok_or_else(|| EngineError::Validation(format!("unknown job '{job_id}'")))
    }

    fn jobs_in(&self, state: RunState) -> Vec<JobId> {
        self.scheduler
            .job_ids()
            .filter(|id| self.scheduler.run_state_of(id) == Some(state))
            .map(str::to_string)
            .collect()
    }
}

/// Wait for the queue's outcome, enforcing `timeout` as a hard ceiling.
///
/// On timeout the queue job is aborted and a timeout failure is reported
/// right away; the handler is expected to stop on its cancelled token.
fn spawn_watcher(
    queue: JobQueue,
    tx: mpsc::Sender<RuntimeEvent>,
    job_id: JobId,
    queue_job_id: String,
    outcome_rx: oneshot::Receiver<JobResult>,
    timeout: Option<Duration>,
) {
    let dispatched_at = Utc::now();

    tokio::spawn(async move {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, outcome_rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(job_id = %job_id, queue_job_id = %queue_job_id, timeout_ms = limit.as_millis() as u64, "job timed out; aborting");
                    if let Err(e) = queue.abort(&queue_job_id, ErrorCategory::Timeout).await {
                        warn!(job_id = %job_id, queue_job_id = %queue_job_id, error = %e, "aborting timed-out job failed");
                    }
                    let result = JobResult::failed(
                        job_id.clone(),
                        ErrorCategory::Timeout,
                        format!("job exceeded its timeout of {} ms", limit.as_millis()),
                        dispatched_at,
                    );
                    let _ = tx.send(RuntimeEvent::JobFinished { job_id, result }).await;
                    return;
                }
            },
            None => outcome_rx.await,
        };

        let result = received.unwrap_or_else(|_| {
            JobResult::failed(
                job_id.clone(),
                ErrorCategory::Cancelled,
                "job was removed from the queue",
                dispatched_at,
            )
        });
        let _ = tx.send(RuntimeEvent::JobFinished { job_id, result }).await;
    });
}
