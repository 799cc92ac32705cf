// src/exec/handler.rs

//! Pluggable job handler abstraction.
//!
//! The engine never knows what a job does: it looks up the handler
//! registered for the job's `type` and calls it with the spec and a
//! [`JobContext`].
//!
//! - Production code registers real handlers (see [`super::command`]).
//! - Tests register closures through [`HandlerRegistry::register_fn`] that
//!   record calls, fail on demand or block until cancelled.
//!
//! Handlers must watch [`JobContext::cancelled`] and return promptly once it
//! fires; the engine does not preempt them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::governor::UsageMeter;
use crate::types::{ExecutionId, JobSpec};

/// Runtime context handed to a handler invocation.
#[derive(Clone)]
pub struct JobContext {
    pub execution_id: ExecutionId,
    pub queue_job_id: String,
    /// 1-based attempt counter.
    pub attempt: u32,
    cancel: CancellationToken,
    meter: Arc<UsageMeter>,
    logs: Arc<Mutex<Vec<String>>>,
}

impl JobContext {
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        queue_job_id: impl Into<String>,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            queue_job_id: queue_job_id.into(),
            attempt,
            cancel,
            meter: Arc::new(UsageMeter::new()),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append a line to the job's log (kept on the queue record).
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        debug!(queue_job_id = %self.queue_job_id, "job log: {}", line);
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is cancelled (timeout, resource violation,
    /// execution cancel).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn report_memory_mb(&self, memory_mb: f64) {
        self.meter.report_memory_mb(memory_mb);
    }

    pub fn report_cpu_percent(&self, cpu_percent: f64) {
        self.meter.report_cpu_percent(cpu_percent);
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("execution_id", &self.execution_id)
            .field("queue_job_id", &self.queue_job_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// A registered implementation of one job `type`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. An `Err` is a handler failure and may be retried.
    async fn run(&self, job: &JobSpec, ctx: JobContext) -> anyhow::Result<Value>;
}

/// Adapter that lets plain async closures act as handlers.
struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobSpec, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, job: &JobSpec, ctx: JobContext) -> anyhow::Result<Value> {
        (self.f)(job.clone(), ctx).await
    }
}

/// Handlers keyed by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `command` and `noop` handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("command", super::command::CommandHandler::new());
        registry.register("noop", super::command::NoopHandler);
        registry
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobSpec, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(job_type, FnHandler { f })
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
