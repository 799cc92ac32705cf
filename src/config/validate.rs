// src/config/validate.rs

use crate::config::model::{EngineConfig, JobEntry, PipelineFile, RawEngineConfig, RawPipelineFile};
use crate::dag::validate_job_specs;
use crate::errors::{EngineError, Result};
use crate::types::{JobConfig, JobSpec};

impl TryFrom<RawEngineConfig> for EngineConfig {
    type Error = EngineError;

    fn try_from(raw: RawEngineConfig) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(EngineConfig::new_unchecked(raw))
    }
}

impl TryFrom<RawPipelineFile> for PipelineFile {
    type Error = EngineError;

    fn try_from(raw: RawPipelineFile) -> std::result::Result<Self, Self::Error> {
        if raw.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "pipeline `name` must not be empty".to_string(),
            ));
        }

        let jobs = raw
            .job
            .into_iter()
            .map(job_spec_from_entry)
            .collect::<Result<Vec<_>>>()?;

        validate_job_specs(&jobs)?;
        Ok(PipelineFile::new_unchecked(raw.name, jobs))
    }
}

fn job_spec_from_entry(entry: JobEntry) -> Result<JobSpec> {
    let mut config = JobConfig::new();
    for (key, value) in entry.config {
        let json = serde_json::to_value(&value).map_err(|e| {
            EngineError::ConfigError(format!(
                "job '{}': config key '{}' is not representable as JSON: {}",
                entry.id, key, e
            ))
        })?;
        config.insert(key, json);
    }

    Ok(JobSpec {
        name: entry.name.unwrap_or_else(|| entry.id.clone()),
        id: entry.id,
        job_type: entry.job_type,
        depends_on: entry.depends_on,
        config,
        resource_limits: entry.resource_limits.map(Into::into),
        timeout_ms: entry.timeout_ms,
        priority: entry.priority,
        max_retries: entry.max_retries,
    })
}

/// One day.
const MAX_LEASE_MS: u64 = 86_400_000;

fn validate_raw_config(cfg: &RawEngineConfig) -> Result<()> {
    validate_backend(cfg)?;

    if cfg.state.ttl_secs == 0 {
        return Err(EngineError::ConfigError(
            "[state].ttl_secs must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.lock.default_ttl_ms == 0 {
        return Err(EngineError::ConfigError(
            "[lock].default_ttl_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.queue.concurrency == 0 {
        return Err(EngineError::ConfigError(
            "[queue].concurrency must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.queue.backoff_base_ms > cfg.queue.backoff_max_ms {
        return Err(EngineError::ConfigError(format!(
            "[queue].backoff_base_ms ({}) must not exceed backoff_max_ms ({})",
            cfg.queue.backoff_base_ms, cfg.queue.backoff_max_ms
        )));
    }

    if cfg.queue.poll_interval_ms == 0 {
        return Err(EngineError::ConfigError(
            "[queue].poll_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.queue.lease_ms < cfg.queue.poll_interval_ms.saturating_mul(2) || cfg.queue.lease_ms > MAX_LEASE_MS {
        return Err(EngineError::ConfigError(format!(
            "[queue].lease_ms ({}) must be at least twice poll_interval_ms ({}) and at most {MAX_LEASE_MS}",
            cfg.queue.lease_ms, cfg.queue.poll_interval_ms
        )));
    }

    // Outcomes of evicted jobs can no longer be polled by other processes.
    if cfg.queue.retain_completed == 0 || cfg.queue.retain_failed == 0 {
        return Err(EngineError::ConfigError(
            "[queue].retain_completed and retain_failed must be >= 1".to_string(),
        ));
    }

    if cfg.orchestrator.default_parallelism == 0 {
        return Err(EngineError::ConfigError(
            "[orchestrator].default_parallelism must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.governor.sample_interval_ms == 0 {
        return Err(EngineError::ConfigError(
            "[governor].sample_interval_ms must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(())
}

fn validate_backend(cfg: &RawEngineConfig) -> Result<()> {
    if cfg.backend.key_prefix.trim().is_empty() {
        return Err(EngineError::ConfigError(
            "[backend].key_prefix must not be empty".to_string(),
        ));
    }

    let url = cfg.backend.url.as_str();
    let supported = ["memory://", "redis://", "rediss://"];
    if !supported.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(EngineError::ConfigError(format!(
            "[backend].url '{}' has an unsupported scheme (expected memory://, redis:// or rediss://)",
            url
        )));
    }

    Ok(())
}
