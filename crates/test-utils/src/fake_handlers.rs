#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipedag::exec::{JobContext, JobHandler};
use pipedag::types::JobSpec;
use serde_json::{Value, json};

/// Records which jobs ran, in start order, and how many overlapped.
///
/// Each run sleeps for `delay` (cancellable) and returns `{"job": id}`.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    delay: Duration,
    started: Arc<Mutex<Vec<String>>>,
    finished: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// How many times `job_id` was started.
    pub fn runs_of(&self, job_id: &str) -> usize {
        self.started().iter().filter(|id| *id == job_id).count()
    }

    /// Highest number of runs that were in progress at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn run(&self, job: &JobSpec, ctx: JobContext) -> anyhow::Result<Value> {
        self.started.lock().unwrap().push(job.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        let outcome = if self.delay.is_zero() {
            Ok(())
        } else {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(()),
                _ = ctx.cancelled() => Err(anyhow::anyhow!("cancelled")),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome?;
        self.finished.lock().unwrap().push(job.id.clone());
        Ok(json!({ "job": job.id }))
    }
}

/// Fails the first `failures` attempts of every job, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyHandler {
    failures: u32,
    attempts: Arc<Mutex<HashMap<String, Vec<u32>>>>,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: Arc::default(),
        }
    }

    /// Failing forever.
    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    /// Attempt numbers seen for `job_id`, in call order.
    pub fn attempts_of(&self, job_id: &str) -> Vec<u32> {
        self.attempts
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn run(&self, job: &JobSpec, ctx: JobContext) -> anyhow::Result<Value> {
        self.attempts
            .lock()
            .unwrap()
            .entry(job.id.clone())
            .or_default()
            .push(ctx.attempt);

        if ctx.attempt <= self.failures {
            anyhow::bail!("attempt {} of {} failed", ctx.attempt, job.id);
        }
        Ok(json!({ "job": job.id, "attempt": ctx.attempt }))
    }
}

/// Never finishes on its own; returns an error once cancelled.
#[derive(Debug, Clone, Default)]
pub struct BlockingHandler {
    started: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

impl BlockingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Runs that observed their cancellation token.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` runs have started.
    pub async fn wait_started(&self, n: usize) {
        while self.started() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl JobHandler for BlockingHandler {
    async fn run(&self, _job: &JobSpec, ctx: JobContext) -> anyhow::Result<Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        ctx.cancelled().await;
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("stopped by cancellation")
    }
}

/// Reports `memory_mb` through the context, then waits to be cancelled.
#[derive(Debug, Clone)]
pub struct MemoryHogHandler {
    memory_mb: f64,
}

impl MemoryHogHandler {
    pub fn new(memory_mb: f64) -> Self {
        Self { memory_mb }
    }
}

#[async_trait]
impl JobHandler for MemoryHogHandler {
    async fn run(&self, _job: &JobSpec, ctx: JobContext) -> anyhow::Result<Value> {
        ctx.report_memory_mb(self.memory_mb);
        ctx.cancelled().await;
        anyhow::bail!("stopped by cancellation")
    }
}
