// src/engine/cache.rs

//! Result cache keyed by job fingerprint.
//!
//! A fingerprint is the blake3 hash of the job type plus its config as
//! canonical JSON (object keys sorted). Two jobs with the same fingerprint
//! are assumed to produce the same output, so a cached successful result can
//! stand in for a dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::backend::{KeySpace, KvBackend};
use crate::errors::{BackendError, Result};
use crate::types::{JobResult, JobSpec};

#[derive(Debug, Clone)]
pub struct ResultCache {
    backend: Arc<dyn KvBackend>,
    keys: KeySpace,
    ttl: Duration,
}

/// Stable fingerprint of what a job computes.
pub fn fingerprint(spec: &JobSpec) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(spec.job_type.as_bytes());
    hasher.update(&[0]);
    // `serde_json::Map` is ordered by key, so this is canonical.
    hasher.update(serde_json::Value::Object(spec.config.clone()).to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

impl ResultCache {
    pub fn new(backend: Arc<dyn KvBackend>, keys: KeySpace, ttl: Duration) -> Self {
        Self { backend, keys, ttl }
    }

    /// A fresh `JobResult` for `spec` built from a cached success, if any.
    pub async fn lookup(&self, spec: &JobSpec) -> Result<Option<JobResult>> {
        let fp = fingerprint(spec);
        let Some(raw) = self.backend.get(&self.keys.cache(&fp)).await? else {
            return Ok(None);
        };
        let cached: JobResult = serde_json::from_str(&raw).map_err(BackendError::from)?;
        if !cached.success {
            return Ok(None);
        }

        debug!(job_id = %spec.id, fingerprint = %fp, "result cache hit");
        let now = Utc::now();
        Ok(Some(JobResult {
            job_id: spec.id.clone(),
            started_at: now,
            completed_at: now,
            execution_time_ms: Some(0),
            attempts: 0,
            cached: true,
            ..cached
        }))
    }

    /// Remember a successful result. Failures are never cached.
    pub async fn store(&self, spec: &JobSpec, result: &JobResult) -> Result<()> {
        if !result.success || result.cached {
            return Ok(());
        }
        let fp = fingerprint(spec);
        let raw = serde_json::to_string(result).map_err(BackendError::from)?;
        self.backend
            .set(&self.keys.cache(&fp), &raw, Some(self.ttl))
            .await?;
        debug!(job_id = %spec.id, fingerprint = %fp, "result cached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_id_and_key_order() {
        let a = JobSpec::new("a", "train")
            .with_config("lr", 0.1)
            .with_config("epochs", 10);
        let b = JobSpec::new("b", "train")
            .with_config("epochs", 10)
            .with_config("lr", 0.1);
        let c = JobSpec::new("a", "evaluate")
            .with_config("lr", 0.1)
            .with_config("epochs", 10);

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }
}
