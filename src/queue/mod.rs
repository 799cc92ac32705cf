// src/queue/mod.rs

//! Durable priority/retry-aware job queue.
//!
//! Jobs live in the shared backend (see [`store`]), not in this process:
//! any number of [`JobQueue`]s started on the same backend and key prefix
//! consume the same ready list, and jobs survive a restart. Each queue runs
//! its own dispatcher that claims jobs atomically, runs them under the
//! resource governor, renews their leases and puts back jobs whose worker
//! died.
//!
//! The orchestrator never runs handlers itself: it submits jobs here and
//! awaits the final outcome on the one-shot channel returned by
//! [`JobQueue::wait`]. Retries with exponential backoff happen inside the
//! queue and are invisible to the orchestrator.
//!
//! - [`record`] holds the persisted record, index and status types.
//! - [`store`] reads and writes them through the backend.
//! - [`worker`] owns the dispatcher loop and the per-attempt runner.

pub mod record;
pub(crate) mod store;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{KeySpace, KvBackend};
use crate::config::model::QueueSection;
use crate::errors::{BackendResult, EngineError, Result};
use crate::exec::HandlerRegistry;
use crate::governor::ResourceGovernor;
use crate::types::{ErrorCategory, JobResult, MAX_PRIORITY};

pub use record::{JobSubmission, QueueJobRecord, QueueJobStatus, QueueStats};
use record::{ReadyEntry, Stage};
use store::QueueStore;

/// Handle to a running queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug)]
pub(crate) struct QueueInner {
    pub(crate) store: QueueStore,
    /// Attempts running in this process and local waiters.
    pub(crate) local: Mutex<LocalState>,
    /// Wakes the dispatcher when something may have become runnable.
    pub(crate) notify: Notify,
    pub(crate) registry: HandlerRegistry,
    pub(crate) governor: ResourceGovernor,
    pub(crate) settings: QueueSection,
    pub(crate) worker_id: String,
    pub(crate) shutdown: CancellationToken,
}

/// An attempt running in this process.
#[derive(Debug)]
pub(crate) struct ActiveJob {
    pub(crate) claim: String,
    pub(crate) cancel: CancellationToken,
    /// Set by [`JobQueue::abort`]; the attempt then ends with this category
    /// and is not retried.
    pub(crate) aborted: Option<ErrorCategory>,
}

#[derive(Debug, Default)]
pub(crate) struct LocalState {
    pub(crate) active: HashMap<String, ActiveJob>,
    pub(crate) waiters: HashMap<String, Vec<oneshot::Sender<JobResult>>>,
}

impl QueueInner {
    /// Move a job into the completed or failed list, store its outcome and
    /// hand it to local waiters.
    ///
    /// Only jobs currently in one of the `from` stages are finished; returns
    /// whether this call did it.
    pub(crate) async fn finish(
        &self,
        id: &str,
        outcome: JobResult,
        from: &[Stage],
        logs: Vec<String>,
    ) -> BackendResult<bool> {
        let success = outcome.success;
        let retain = if success {
            self.settings.retain_completed
        } else {
            self.settings.retain_failed
        };

        let transition = self
            .store
            .update_index(|index| match index.stage_of(id) {
                Some(stage) if from.contains(&stage) => {
                    index.remove(id);
                    (Some(index.push_finished(id, success, retain)), true)
                }
                _ => (None, false),
            })
            .await?;
        let Some(evicted) = transition else {
            return Ok(false);
        };

        self.store
            .update(id, |record| {
                record.status = if success {
                    QueueJobStatus::Completed
                } else {
                    QueueJobStatus::Failed
                };
                record.finished_at = Some(outcome.completed_at);
                record.failed_reason = outcome.error.clone();
                record.outcome = Some(outcome.clone());
                record.logs.extend(logs.iter().cloned());
                record.claimed_by = None;
                record.lease_expires_at = None;
                record.retry_at = None;
                true
            })
            .await?;

        for old in &evicted {
            self.store.delete(old).await?;
        }
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "finished jobs past retention removed");
        }

        self.deliver(id, outcome).await;
        Ok(true)
    }

    /// Hand an outcome to everybody waiting on it in this process.
    pub(crate) async fn deliver(&self, id: &str, outcome: JobResult) {
        let waiters = self.local.lock().await.waiters.remove(id);
        for tx in waiters.unwrap_or_default() {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Put a delayed or stalled job back on the ready list.
    ///
    /// The record is only touched if `claim` still matches, so a worker
    /// that claimed the job in the meantime is not overwritten.
    pub(crate) async fn requeue(&self, id: &str, from: Stage, claim: Option<&str>) -> BackendResult<bool> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(false);
        };
        let entry = ReadyEntry::of(&record);

        let moved = self
            .store
            .update_index(|index| {
                if index.stage_of(id) != Some(from) {
                    return (false, false);
                }
                index.remove(id);
                index.push_ready(entry.clone());
                (true, true)
            })
            .await?;
        if !moved {
            return Ok(false);
        }

        self.store
            .update(id, |record| {
                if record.claimed_by.as_deref() != claim || record.status.is_terminal() {
                    return false;
                }
                record.status = QueueJobStatus::ready_for(record.spec.priority);
                record.claimed_by = None;
                record.lease_expires_at = None;
                record.retry_at = None;
                true
            })
            .await?;

        self.notify.notify_one();
        Ok(true)
    }
}

impl JobQueue {
    /// Create the queue on `backend` and spawn its dispatcher. Must be
    /// called from within a tokio runtime.
    ///
    /// Jobs left behind by a worker that died are picked up once their
    /// lease expires.
    pub fn start(
        backend: Arc<dyn KvBackend>,
        keys: KeySpace,
        registry: HandlerRegistry,
        governor: ResourceGovernor,
        settings: &QueueSection,
    ) -> Self {
        let inner = Arc::new(QueueInner {
            store: QueueStore::new(backend, keys),
            local: Mutex::new(LocalState::default()),
            notify: Notify::new(),
            registry,
            governor: governor.with_process_sampling(settings.concurrency == 1),
            worker_id: settings.effective_worker_id(),
            settings: settings.clone(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(worker::dispatch_loop(Arc::clone(&inner)));
        info!(
            worker_id = %inner.worker_id,
            concurrency = settings.concurrency,
            "job queue started"
        );

        Self { inner }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Validate and enqueue one job. Returns the queue job id.
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<String> {
        let mut ids = self.submit_jobs_bulk(vec![submission]).await?;
        ids.pop()
            .ok_or_else(|| EngineError::Validation("submission produced no job".to_string()))
    }

    /// All-or-nothing: every job is validated before any is enqueued, and
    /// all of them enter the ready list in one write.
    pub async fn submit_jobs_bulk(&self, submissions: Vec<JobSubmission>) -> Result<Vec<String>> {
        for submission in &submissions {
            self.validate(submission)?;
        }

        let mut entries = Vec::with_capacity(submissions.len());
        for submission in submissions {
            let record = QueueJobRecord::new(Uuid::new_v4().to_string(), submission);
            self.inner.store.put(&record).await?;
            debug!(
                queue_job_id = %record.id,
                job_id = %record.spec.id,
                execution_id = %record.execution_id,
                priority = record.spec.priority,
                "job submitted"
            );
            entries.push(ReadyEntry::of(&record));
        }

        self.inner
            .store
            .update_index(|index| {
                for entry in &entries {
                    index.push_ready(entry.clone());
                }
                ((), true)
            })
            .await?;

        self.inner.notify.notify_one();
        Ok(entries.into_iter().map(|e| e.id).collect())
    }

    pub async fn get_job_status(&self, id: &str) -> Result<QueueJobStatus> {
        Ok(self
            .inner
            .store
            .get(id)
            .await?
            .map(|r| r.status)
            .unwrap_or(QueueJobStatus::NotFound))
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<QueueJobRecord>> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Remove a job that has not started yet. Returns `false` once it is
    /// active or terminal.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        let removed = self
            .inner
            .store
            .update_index(|index| match index.stage_of(id) {
                Some(Stage::Ready | Stage::Delayed) => {
                    index.remove(id);
                    (true, true)
                }
                _ => (false, false),
            })
            .await?;
        if !removed {
            return Ok(false);
        }

        self.inner.store.delete(id).await?;
        self.inner.local.lock().await.waiters.remove(id);
        debug!(queue_job_id = id, "queued job cancelled");
        Ok(true)
    }

    /// Stop a job for good, whatever its stage.
    ///
    /// - Active here: its token is cancelled and the attempt ends as failed
    ///   with `category`, without retry.
    /// - Active on another worker: the request is stored on the record and
    ///   that worker stops the attempt on its next poll.
    /// - Queued or delayed: it is failed immediately with `category`.
    ///
    /// Returns `false` for unknown or terminal jobs.
    pub async fn abort(&self, id: &str, category: ErrorCategory) -> Result<bool> {
        if let Some(active) = self.inner.local.lock().await.active.get_mut(id) {
            active.aborted = Some(category);
            active.cancel.cancel();
            debug!(queue_job_id = id, %category, "active job aborted");
            return Ok(true);
        }

        let Some(record) = self.inner.store.get(id).await? else {
            return Ok(false);
        };

        let mut outcome = JobResult::failed(
            record.spec.id.clone(),
            category,
            format!("job aborted before it started ({category})"),
            record.created_at,
        );
        outcome.attempts = record.attempts_made;
        outcome.worker_id = Some(self.inner.worker_id.clone());
        if self
            .inner
            .finish(id, outcome, &[Stage::Ready, Stage::Delayed], Vec::new())
            .await?
        {
            debug!(queue_job_id = id, %category, "queued job aborted");
            return Ok(true);
        }

        let requested = self
            .inner
            .store
            .update(id, |record| {
                if record.status.is_terminal() || record.abort_requested.is_some() {
                    return false;
                }
                record.abort_requested = Some(category);
                true
            })
            .await?;
        if requested.is_some() {
            debug!(queue_job_id = id, %category, "abort requested from the owning worker");
        }
        Ok(requested.is_some())
    }

    /// One-shot receiver for the job's final outcome.
    ///
    /// Resolves immediately for terminal jobs; `None` for unknown ids. The
    /// outcome arrives whichever worker runs the job.
    pub async fn wait(&self, id: &str) -> Result<Option<oneshot::Receiver<JobResult>>> {
        // Held across the read so a local finish cannot slip in between.
        let mut local = self.inner.local.lock().await;
        let Some(record) = self.inner.store.get(id).await? else {
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        match record.outcome {
            Some(outcome) => {
                let _ = tx.send(outcome);
            }
            None => local.waiters.entry(id.to_string()).or_default().push(tx),
        }
        Ok(Some(rx))
    }

    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let index = self.inner.store.index().await?;
        let queued = index.queued();

        Ok(QueueStats {
            waiting: if index.paused { 0 } else { queued },
            paused: if index.paused { queued } else { 0 },
            active: index.active.len(),
            completed: index.completed.len(),
            failed: index.failed.len(),
            delayed: index.delayed.len(),
        })
    }

    /// Stop every worker on this backend from starting new attempts.
    /// Active attempts run on.
    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true).await?;
        info!("job queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false).await?;
        self.inner.notify.notify_one();
        info!("job queue resumed");
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool> {
        Ok(self.inner.store.index().await?.paused)
    }

    /// Dispatcher running and backend reachable.
    pub async fn is_healthy(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        match self.inner.store.backend().ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "job queue health check failed");
                false
            }
        }
    }

    /// Stop the dispatcher. Active attempts are cancelled and their jobs
    /// go back to the ready list for other workers; local waiters are
    /// dropped.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut local = self.inner.local.lock().await;
        for (id, active) in &local.active {
            debug!(queue_job_id = %id, "releasing active job on shutdown");
            active.cancel.cancel();
        }
        local.waiters.clear();
        info!("job queue shut down");
    }

    /// Retry delay after `attempt` failed attempts.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(&self.inner.settings, attempt)
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        self.inner
            .store
            .update_index(|index| {
                let changed = index.paused != paused;
                index.paused = paused;
                ((), changed)
            })
            .await?;
        Ok(())
    }

    fn validate(&self, submission: &JobSubmission) -> Result<()> {
        let spec = &submission.spec;
        if spec.id.trim().is_empty() {
            return Err(EngineError::Validation("job id must not be empty".to_string()));
        }
        if spec.priority > MAX_PRIORITY {
            return Err(EngineError::Validation(format!(
                "job '{}' has priority {} (expected 0..={})",
                spec.id, spec.priority, MAX_PRIORITY
            )));
        }
        if !self.inner.registry.contains(&spec.job_type) {
            return Err(EngineError::Validation(format!(
                "job '{}' has type '{}' with no registered handler",
                spec.id, spec.job_type
            )));
        }
        if self.inner.shutdown.is_cancelled() {
            warn!(job_id = %spec.id, "submission after queue shutdown");
            return Err(EngineError::Validation("job queue is shut down".to_string()));
        }
        Ok(())
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
pub(crate) fn backoff_delay(settings: &QueueSection, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = settings
        .backoff_base_ms
        .saturating_mul(1u64 << exponent)
        .min(settings.backoff_max_ms);
    Duration::from_millis(delay)
}
