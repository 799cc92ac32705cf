// src/queue/worker.rs

//! Dispatcher loop and per-attempt runner.
//!
//! Every poll the dispatcher:
//!
//! 1. maintains its own attempts: renews leases, honours aborts requested
//!    from other processes, and polls outcomes of jobs it waits on but does
//!    not run;
//! 2. sweeps the index now and then for stalled jobs and due retries;
//! 3. claims ready jobs until it runs `concurrency` attempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::BackendResult;
use crate::exec::JobContext;
use crate::queue::record::Stage;
use crate::queue::{ActiveJob, QueueInner, QueueJobStatus, backoff_delay};
use crate::types::{ErrorCategory, ExecutionId, JobResult, JobSpec};

/// An attempt claimed from the ready list.
struct Attempt {
    queue_job_id: String,
    /// Claim token written to the record; proves this attempt still owns it.
    claim: String,
    execution_id: ExecutionId,
    spec: JobSpec,
    attempt: u32,
    cancel: CancellationToken,
}

/// Result of one attempt, before retry policy is applied.
struct AttemptOutcome {
    result: JobResult,
    retryable: bool,
    logs: Vec<String>,
}

/// Runs until the queue is shut down.
pub(crate) async fn dispatch_loop(inner: Arc<QueueInner>) {
    info!(worker_id = %inner.worker_id, "queue dispatcher started");

    let poll = Duration::from_millis(inner.settings.poll_interval_ms);
    let sweep_every = Duration::from_millis((inner.settings.lease_ms / 2).max(1));
    let mut next_sweep = Instant::now();
    let mut suspects = HashMap::new();

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        if let Err(e) = maintain(&inner).await {
            warn!(error = %e, "queue maintenance failed");
        }

        if Instant::now() >= next_sweep {
            if let Err(e) = sweep(&inner, &mut suspects).await {
                warn!(error = %e, "queue sweep failed");
            }
            next_sweep = Instant::now() + sweep_every;
        }

        loop {
            match claim_next(&inner).await {
                Ok(Some(attempt)) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        run_attempt(inner, attempt).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "claiming a job failed");
                    break;
                }
            }
        }

        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
    }

    info!("queue dispatcher finished (shutdown)");
}

/// Take the next ready job this worker has a handler for, if a slot is free.
async fn claim_next(inner: &QueueInner) -> BackendResult<Option<Attempt>> {
    loop {
        if inner.local.lock().await.active.len() >= inner.settings.concurrency {
            return Ok(None);
        }

        let claimed = inner
            .store
            .update_index(|index| match index.claim(|e| inner.registry.contains(&e.job_type)) {
                Some(entry) => (Some(entry), true),
                None => (None, false),
            })
            .await?;
        let Some(entry) = claimed else {
            return Ok(None);
        };

        let claim = Uuid::new_v4().to_string();
        let lease = lease_duration(inner);
        let record = inner
            .store
            .update(&entry.id, |record| {
                let now = Utc::now();
                record.status = QueueJobStatus::Active;
                record.attempts_made += 1;
                record.processed_at.get_or_insert(now);
                record.worker_id = Some(inner.worker_id.clone());
                record.claimed_by = Some(claim.clone());
                record.lease_expires_at = Some(now + lease);
                record.retry_at = None;
                true
            })
            .await?;

        let Some(record) = record else {
            warn!(queue_job_id = %entry.id, "claimed job has no record; dropping it");
            inner
                .store
                .update_index(|index| (index.remove(&entry.id).is_some(), true))
                .await?;
            continue;
        };

        let cancel = CancellationToken::new();
        inner.local.lock().await.active.insert(
            record.id.clone(),
            ActiveJob {
                claim: claim.clone(),
                cancel: cancel.clone(),
                aborted: None,
            },
        );

        return Ok(Some(Attempt {
            queue_job_id: record.id,
            claim,
            execution_id: record.execution_id,
            spec: record.spec,
            attempt: record.attempts_made,
            cancel,
        }));
    }
}

/// Lease upkeep for local attempts and outcome polling for local waiters.
async fn maintain(inner: &QueueInner) -> BackendResult<()> {
    let (own, waiting) = {
        let local = inner.local.lock().await;
        let own: Vec<(String, String, CancellationToken)> = local
            .active
            .iter()
            .map(|(id, a)| (id.clone(), a.claim.clone(), a.cancel.clone()))
            .collect();
        let waiting: Vec<String> = local
            .waiters
            .keys()
            .filter(|id| !local.active.contains_key(*id))
            .cloned()
            .collect();
        (own, waiting)
    };

    let lease = lease_duration(inner);
    for (id, claim, cancel) in own {
        let Some(record) = inner.store.get(&id).await? else {
            cancel.cancel();
            continue;
        };
        if record.claimed_by.as_deref() != Some(claim.as_str()) {
            warn!(queue_job_id = %id, "lease lost to another worker; stopping attempt");
            cancel.cancel();
            continue;
        }

        if let Some(category) = record.abort_requested {
            if let Some(active) = inner.local.lock().await.active.get_mut(&id) {
                active.aborted.get_or_insert(category);
                active.cancel.cancel();
            }
            debug!(queue_job_id = %id, %category, "abort requested elsewhere");
            continue;
        }

        let now = Utc::now();
        if record.lease_expires_at.is_none_or(|at| at - now < lease / 2) {
            inner
                .store
                .update(&id, |record| {
                    if record.claimed_by.as_deref() != Some(claim.as_str()) {
                        return false;
                    }
                    record.lease_expires_at = Some(Utc::now() + lease);
                    true
                })
                .await?;
        }
    }

    for id in waiting {
        match inner.store.get(&id).await? {
            Some(record) => {
                if let Some(outcome) = record.outcome {
                    inner.deliver(&id, outcome).await;
                }
            }
            None => {
                inner.local.lock().await.waiters.remove(&id);
            }
        }
    }

    Ok(())
}

/// Recover stalled jobs and promote due retries.
///
/// `suspects` counts sightings of active ids whose record is not active
/// (yet); one sighting may be a claim in progress, two are not.
async fn sweep(inner: &QueueInner, suspects: &mut HashMap<String, u32>) -> BackendResult<()> {
    let index = inner.store.index().await?;
    let own: HashSet<String> = inner.local.lock().await.active.keys().cloned().collect();
    let now = Utc::now();

    suspects.retain(|id, _| index.active.contains(id));

    for id in &index.active {
        if own.contains(id) {
            continue;
        }

        let record = inner.store.get(id).await?;
        let stalled = match &record {
            Some(r) if r.status == QueueJobStatus::Active => {
                suspects.remove(id);
                r.lease_expired(now)
            }
            _ => {
                let seen = suspects.entry(id.clone()).or_insert(0);
                *seen += 1;
                *seen >= 2
            }
        };
        if !stalled {
            continue;
        }
        suspects.remove(id);

        match record {
            None => {
                warn!(queue_job_id = %id, "active job has no record; dropping it");
                inner
                    .store
                    .update_index(|index| match index.stage_of(id) {
                        Some(Stage::Active) => (index.remove(id), true),
                        _ => (None, false),
                    })
                    .await?;
            }
            Some(record) => {
                if let Some(category) = record.abort_requested {
                    let mut outcome = JobResult::failed(
                        record.spec.id.clone(),
                        category,
                        format!("job aborted ({category})"),
                        record.processed_at.unwrap_or(record.created_at),
                    );
                    outcome.attempts = record.attempts_made;
                    outcome.worker_id = record.worker_id.clone();
                    inner.finish(id, outcome, &[Stage::Active], Vec::new()).await?;
                    continue;
                }

                warn!(
                    queue_job_id = %id,
                    worker_id = record.worker_id.as_deref().unwrap_or_default(),
                    attempt = record.attempts_made,
                    "stalled job recovered; returning it to the ready list"
                );
                inner
                    .requeue(id, Stage::Active, record.claimed_by.as_deref())
                    .await?;
            }
        }
    }

    for id in &index.delayed {
        let due = inner.store.get(id).await?.is_some_and(|r| {
            r.status == QueueJobStatus::Delayed && r.retry_at.is_none_or(|at| at <= now)
        });
        if due {
            inner.requeue(id, Stage::Delayed, None).await?;
        }
    }

    Ok(())
}

async fn run_attempt(inner: Arc<QueueInner>, attempt: Attempt) {
    debug!(
        queue_job_id = %attempt.queue_job_id,
        job_id = %attempt.spec.id,
        execution_id = %attempt.execution_id,
        attempt = attempt.attempt,
        "attempt started"
    );

    let outcome = execute(&inner, &attempt).await;
    if let Err(e) = settle(&inner, &attempt, outcome).await {
        // The lease runs out and a sweep puts the job back.
        warn!(
            queue_job_id = %attempt.queue_job_id,
            error = %e,
            "recording attempt outcome failed"
        );
        inner.local.lock().await.active.remove(&attempt.queue_job_id);
    }

    // A slot is free again.
    inner.notify.notify_one();
}

/// Invoke the handler under governor supervision.
async fn execute(inner: &QueueInner, attempt: &Attempt) -> AttemptOutcome {
    let started_at = Utc::now();
    let spec = &attempt.spec;

    let Some(handler) = inner.registry.get(&spec.job_type) else {
        return AttemptOutcome {
            result: JobResult::failed(
                spec.id.clone(),
                ErrorCategory::Handler,
                format!("no handler registered for type '{}'", spec.job_type),
                started_at,
            ),
            retryable: false,
            logs: Vec::new(),
        };
    };

    let ctx = JobContext::new(
        attempt.execution_id.clone(),
        attempt.queue_job_id.clone(),
        attempt.attempt,
        attempt.cancel.clone(),
    );

    let supervised = inner.governor.supervise(
        &spec.id,
        spec.resource_limits.as_ref(),
        ctx.meter(),
        &attempt.cancel,
        handler.run(spec, ctx.clone()),
    );

    // Dropping the handler future on cancellation stops async handlers at
    // their next await point even if they ignore the token.
    let (result, retryable) = tokio::select! {
        biased;

        supervised = supervised => match supervised {
            Ok(Ok(output)) => (JobResult::succeeded(spec.id.clone(), output, started_at), false),
            Ok(Err(e)) => (
                JobResult::failed(spec.id.clone(), ErrorCategory::Handler, format!("{e:#}"), started_at),
                true,
            ),
            Err(violation) => (
                JobResult::failed(
                    spec.id.clone(),
                    ErrorCategory::ResourceViolation,
                    violation.to_string(),
                    started_at,
                ),
                false,
            ),
        },

        _ = attempt.cancel.cancelled() => (
            JobResult::failed(spec.id.clone(), ErrorCategory::Cancelled, "job was cancelled", started_at),
            false,
        ),
    };

    AttemptOutcome {
        result,
        retryable,
        logs: ctx.logs(),
    }
}

/// Apply retry policy and record the attempt.
async fn settle(inner: &Arc<QueueInner>, attempt: &Attempt, outcome: AttemptOutcome) -> BackendResult<()> {
    let id = attempt.queue_job_id.as_str();
    let number = attempt.attempt;
    let max_retries = attempt.spec.max_retries;

    let local_abort = inner
        .local
        .lock()
        .await
        .active
        .remove(id)
        .and_then(|a| a.aborted);

    let Some(record) = inner.store.get(id).await? else {
        return Ok(());
    };
    if record.claimed_by.as_deref() != Some(attempt.claim.as_str()) {
        warn!(queue_job_id = id, attempt = number, "lease was lost; discarding attempt outcome");
        return Ok(());
    }
    let aborted = local_abort.or(record.abort_requested);

    let mut result = outcome.result;
    result.attempts = number;
    result.worker_id = Some(inner.worker_id.clone());

    if aborted.is_none() && !result.success && inner.shutdown.is_cancelled() {
        debug!(queue_job_id = id, "attempt cut by shutdown; releasing job");
        inner.requeue(id, Stage::Active, Some(attempt.claim.as_str())).await?;
        return Ok(());
    }

    if let Some(category) = aborted {
        if result.success {
            debug!(queue_job_id = id, "aborted attempt finished successfully; keeping the result");
        } else {
            result.error_category = Some(category);
            result.error = Some(format!("job aborted ({category})"));
        }
    }

    let retry = !result.success
        && aborted.is_none()
        && outcome.retryable
        && number <= max_retries
        && !inner.shutdown.is_cancelled();

    if retry {
        let delay = backoff_delay(&inner.settings, number);
        warn!(
            queue_job_id = id,
            job_id = %result.job_id,
            attempt = number,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            error = result.error.as_deref().unwrap_or_default(),
            "attempt failed; retrying after backoff"
        );
        return schedule_retry(inner, attempt, result, outcome.logs, delay).await;
    }

    if result.success {
        info!(queue_job_id = id, job_id = %result.job_id, attempt = number, "job completed");
    } else {
        warn!(
            queue_job_id = id,
            job_id = %result.job_id,
            attempt = number,
            category = ?result.error_category,
            error = result.error.as_deref().unwrap_or_default(),
            "job failed permanently"
        );
    }
    inner.finish(id, result, &[Stage::Active], outcome.logs).await?;
    Ok(())
}

/// Park the job in the delayed list and promote it once `delay` passed.
///
/// Any worker's sweep promotes it too, so the retry happens even if this
/// process dies first.
async fn schedule_retry(
    inner: &Arc<QueueInner>,
    attempt: &Attempt,
    result: JobResult,
    logs: Vec<String>,
    delay: Duration,
) -> BackendResult<()> {
    let id = attempt.queue_job_id.as_str();
    let retry_at = Utc::now() + TimeDelta::from_std(delay).unwrap_or_default();

    let moved = inner
        .store
        .update_index(|index| match index.stage_of(id) {
            Some(Stage::Active) => {
                index.remove(id);
                index.delayed.push(id.to_string());
                (true, true)
            }
            _ => (false, false),
        })
        .await?;
    if !moved {
        return Ok(());
    }

    inner
        .store
        .update(id, |record| {
            if record.claimed_by.as_deref() != Some(attempt.claim.as_str()) {
                return false;
            }
            record.status = QueueJobStatus::Delayed;
            record.retry_at = Some(retry_at);
            record.failed_reason = result.error.clone();
            record.logs.extend(logs.iter().cloned());
            record.claimed_by = None;
            record.lease_expires_at = None;
            true
        })
        .await?;

    let inner = Arc::clone(inner);
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => return,
        }
        // No-op if cancelled, aborted or promoted by a sweep meanwhile.
        if let Err(e) = inner.requeue(&id, Stage::Delayed, None).await {
            warn!(queue_job_id = %id, error = %e, "promoting delayed job failed");
        }
    });
    Ok(())
}

fn lease_duration(inner: &QueueInner) -> TimeDelta {
    TimeDelta::milliseconds(i64::try_from(inner.settings.lease_ms).unwrap_or(i64::MAX))
}
