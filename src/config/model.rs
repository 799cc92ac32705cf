// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::types::{JobSpec, ResourceLimits};

/// Engine configuration as read from `pipedag.toml`.
///
/// ```toml
/// [backend]
/// url = "redis://127.0.0.1:6379"
/// key_prefix = "pipedag"
///
/// [state]
/// ttl_secs = 604800
///
/// [queue]
/// concurrency = 8
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawEngineConfig {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub governor: GovernorSection,
}

/// Validated engine configuration.
///
/// Only obtainable through `TryFrom<RawEngineConfig>` (see `validate.rs`) or
/// [`EngineConfig::default`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: BackendSection,
    pub state: StateSection,
    pub lock: LockSection,
    pub queue: QueueSection,
    pub orchestrator: OrchestratorSection,
    pub governor: GovernorSection,
}

impl EngineConfig {
    pub(crate) fn new_unchecked(raw: RawEngineConfig) -> Self {
        Self {
            backend: raw.backend,
            state: raw.state,
            lock: raw.lock,
            queue: raw.queue,
            orchestrator: raw.orchestrator,
            governor: raw.governor,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new_unchecked(RawEngineConfig::default())
    }
}

/// `[backend]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// `memory://` for an in-process store, `redis://host:port` otherwise.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Prefix for every key this engine writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_backend_url() -> String {
    "memory://".to_string()
}

fn default_key_prefix() -> String {
    "pipedag".to_string()
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// `[state]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StateSection {
    /// TTL applied to execution state, checkpoints, index and cache keys.
    #[serde(default = "default_state_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_state_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_state_ttl_secs(),
        }
    }
}

/// `[lock]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LockSection {
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Attempts made by `acquire_with_retry`.
    #[serde(default = "default_lock_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_retry_attempts() -> u32 {
    10
}

fn default_lock_retry_delay_ms() -> u64 {
    50
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
            retry_attempts: default_lock_retry_attempts(),
            retry_delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

/// `[queue]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    /// Maximum number of jobs active at once across all executions.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delay before the first retry; doubles on every further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Recorded on every job result; defaults to `worker-<pid>`.
    #[serde(default)]
    pub worker_id: Option<String>,

    /// How often a worker looks for jobs submitted elsewhere, renews the
    /// leases of its active jobs and polls outcomes it is waiting on.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// An active job whose lease is not renewed for this long is considered
    /// stalled (its worker died) and goes back to the ready list.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Number of completed job records kept for inspection.
    #[serde(default = "default_retain_finished")]
    pub retain_completed: usize,

    /// Number of failed job records kept for inspection.
    #[serde(default = "default_retain_finished")]
    pub retain_failed: usize,
}

fn default_concurrency() -> usize {
    4
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_retain_finished() -> usize {
    1_000
}

impl QueueSection {
    pub fn effective_worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            worker_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            lease_ms: default_lease_ms(),
            retain_completed: default_retain_finished(),
            retain_failed: default_retain_finished(),
        }
    }
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// Parallelism used when a caller does not pass one.
    #[serde(default = "default_parallelism")]
    pub default_parallelism: usize,
}

fn default_parallelism() -> usize {
    4
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            default_parallelism: default_parallelism(),
        }
    }
}

/// `[governor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct GovernorSection {
    /// How often memory/CPU are sampled for jobs that enforce those limits.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_sample_interval_ms() -> u64 {
    250
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

/// Pipeline definition as read from a TOML file.
///
/// ```toml
/// name = "train-resnet"
///
/// [[job]]
/// id = "preprocess"
/// type = "command"
/// config = { cmd = "python preprocess.py" }
///
/// [[job]]
/// id = "train"
/// type = "command"
/// depends_on = ["preprocess"]
/// priority = 5
/// max_retries = 2
/// timeout_ms = 3600000
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawPipelineFile {
    /// Workflow name; executions are indexed by it.
    pub name: String,

    #[serde(default)]
    pub job: Vec<JobEntry>,
}

/// Validated pipeline: the job graph is known to be acyclic.
#[derive(Debug, Clone)]
pub struct PipelineFile {
    pub name: String,
    pub jobs: Vec<JobSpec>,
}

impl PipelineFile {
    pub(crate) fn new_unchecked(name: String, jobs: Vec<JobSpec>) -> Self {
        Self { name, jobs }
    }
}

/// `[[job]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Handler type, e.g. `"command"`.
    #[serde(rename = "type")]
    pub job_type: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Passed to the handler as a JSON object.
    #[serde(default)]
    pub config: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub resource_limits: Option<ResourceLimitsEntry>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub priority: u8,

    #[serde(default)]
    pub max_retries: u32,
}

/// `[job.resource_limits]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceLimitsEntry {
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    #[serde(default)]
    pub enforce_memory_limit: bool,
    #[serde(default)]
    pub enforce_cpu_limit: bool,
    #[serde(default)]
    pub enforce_time_limit: bool,
}

impl From<ResourceLimitsEntry> for ResourceLimits {
    fn from(entry: ResourceLimitsEntry) -> Self {
        Self {
            max_execution_time_ms: entry.max_execution_time_ms,
            max_memory_mb: entry.max_memory_mb,
            max_cpu_percent: entry.max_cpu_percent,
            enforce_memory_limit: entry.enforce_memory_limit,
            enforce_cpu_limit: entry.enforce_cpu_limit,
            enforce_time_limit: entry.enforce_time_limit,
        }
    }
}
