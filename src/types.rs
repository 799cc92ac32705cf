//! Records shared by the orchestrator, the state store and the job queue.
//!
//! Everything here is plain data with a stable camelCase JSON shape, since
//! these records cross process boundaries through the key-value backend.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a job, unique within one execution.
pub type JobId = String;

/// Identifier of one execution of a workflow.
pub type ExecutionId = String;

/// Free-form job configuration handed to the handler untouched.
pub type JobConfig = serde_json::Map<String, Value>;

/// Highest accepted job priority.
pub const MAX_PRIORITY: u8 = 10;

/// Per-job resource ceilings enforced by the resource governor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub max_execution_time_ms: Option<u64>,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    pub enforce_memory_limit: bool,
    pub enforce_cpu_limit: bool,
    pub enforce_time_limit: bool,
}

impl ResourceLimits {
    /// Time ceiling, if one is both configured and enforced.
    pub fn enforced_time_limit_ms(&self) -> Option<u64> {
        self.max_execution_time_ms.filter(|_| self.enforce_time_limit)
    }

    pub fn enforced_memory_limit_mb(&self) -> Option<u64> {
        self.max_memory_mb.filter(|_| self.enforce_memory_limit)
    }

    pub fn enforced_cpu_limit_percent(&self) -> Option<f64> {
        self.max_cpu_percent.filter(|_| self.enforce_cpu_limit)
    }

    /// Whether periodic memory/CPU sampling is needed at all.
    pub fn needs_sampling(&self) -> bool {
        self.enforced_memory_limit_mb().is_some() || self.enforced_cpu_limit_percent().is_some()
    }
}

/// Immutable description of one job in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub id: JobId,
    #[serde(default)]
    pub name: String,
    /// Dispatch key of the registered handler.
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub max_retries: u32,
}

impl JobSpec {
    pub fn new(id: impl Into<JobId>, job_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            job_type: job_type.into(),
            depends_on: Vec::new(),
            config: JobConfig::new(),
            resource_limits: None,
            timeout_ms: None,
            priority: 0,
            max_retries: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on(mut self, dep: impl Into<JobId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    /// Name used in logs; falls back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "paused" => Ok(ExecutionStatus::Paused),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: {other}")),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The registered handler returned an error.
    Handler,
    /// The job exceeded its `timeoutMs`.
    Timeout,
    /// The resource governor detected a ceiling violation.
    ResourceViolation,
    /// The job was cancelled together with its execution.
    Cancelled,
}

impl ErrorCategory {
    /// Transient handler failures are retried by the queue; the rest are final.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCategory::Handler)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Handler => "handler",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ResourceViolation => "resource_violation",
            ErrorCategory::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one job; written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub job_id: JobId,
    pub success: bool,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub cached: bool,
}

impl JobResult {
    pub fn succeeded(job_id: impl Into<JobId>, output: Value, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        Self {
            job_id: job_id.into(),
            success: true,
            output: Some(output),
            error: None,
            error_category: None,
            started_at,
            completed_at,
            worker_id: None,
            execution_time_ms: elapsed_ms(started_at, completed_at),
            attempts: 1,
            cached: false,
        }
    }

    pub fn failed(
        job_id: impl Into<JobId>,
        category: ErrorCategory,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let completed_at = Utc::now();
        Self {
            job_id: job_id.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            error_category: Some(category),
            started_at,
            completed_at,
            worker_id: None,
            execution_time_ms: elapsed_ms(started_at, completed_at),
            attempts: 1,
            cached: false,
        }
    }
}

pub(crate) fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> Option<u64> {
    u64::try_from((to - from).num_milliseconds()).ok()
}

/// Mutable state of one execution, owned by the orchestrator and persisted in
/// the state store.
///
/// `current_jobs`, `completed_jobs` and `failed_jobs` are pairwise disjoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    #[serde(default)]
    pub name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_jobs: BTreeSet<JobId>,
    #[serde(default)]
    pub completed_jobs: BTreeSet<JobId>,
    #[serde(default)]
    pub failed_jobs: BTreeSet<JobId>,
    #[serde(default)]
    pub job_results: BTreeMap<JobId, JobResult>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl ExecutionState {
    pub fn new(
        execution_id: impl Into<ExecutionId>,
        workflow_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            name: name.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            current_jobs: BTreeSet::new(),
            completed_jobs: BTreeSet::new(),
            failed_jobs: BTreeSet::new(),
            job_results: BTreeMap::new(),
            checkpoint_id: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Whether the job already reached a terminal set.
    pub fn is_job_terminal(&self, job_id: &str) -> bool {
        self.completed_jobs.contains(job_id) || self.failed_jobs.contains(job_id)
    }
}
