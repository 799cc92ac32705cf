// src/backend/mod.rs

//! Shared key-value backend abstraction.
//!
//! Every component that persists something (locks, execution state,
//! checkpoints, the result cache, the job queue) talks to a [`KvBackend`]
//! instead of a concrete client:
//!
//! - [`memory::MemoryBackend`] keeps everything in-process. TTLs run on the
//!   tokio clock, so tests can pause and advance time.
//! - [`redis::RedisBackend`] talks to a Redis-compatible server and implements
//!   the atomic primitive as a Lua script.
//!
//! The only atomic primitive is [`KvBackend::compare_and_swap`]. All
//! read-modify-write operations are built on it through
//! [`compare_and_update`], which retries on conflict so that concurrent
//! writers never lose updates.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::model::BackendSection;
use crate::errors::{BackendError, BackendResult};

pub mod memory;
pub mod redis;

pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Attempts made by [`compare_and_update`] before giving up on a hot key.
pub const MAX_CAS_ATTEMPTS: usize = 64;

#[async_trait]
pub trait KvBackend: Send + Sync + Debug {
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    /// Unconditional write. `ttl = None` keeps the value forever.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()>;

    /// Returns `true` if a value was removed.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Atomically replace the value of `key` if it currently equals `expected`.
    ///
    /// - `expected = None` requires the key to be absent.
    /// - `new = None` deletes the key.
    ///
    /// Returns `false` (and writes nothing) if the current value differs.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> BackendResult<bool>;

    /// Atomic set-if-absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<bool> {
        self.compare_and_swap(key, None, Some(value), ttl).await
    }

    /// Round-trip used by health checks.
    async fn ping(&self) -> BackendResult<()>;
}

/// What a [`compare_and_update`] closure wants done with the current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Leave the value as it is (no write).
    Keep,
    /// Replace (or create) the value.
    Put(String),
    /// Remove the key.
    Delete,
}

/// Optimistic read-modify-write on a single key.
///
/// `f` sees the current value and decides what to write. The write only lands
/// if nobody changed the key in between; otherwise `f` is re-run against the
/// fresh value. Returns `true` if a write happened, `false` if `f` chose
/// [`Update::Keep`].
pub async fn compare_and_update<F>(
    backend: &dyn KvBackend,
    key: &str,
    ttl: Option<Duration>,
    mut f: F,
) -> BackendResult<bool>
where
    F: FnMut(Option<&str>) -> BackendResult<Update> + Send,
{
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let current = backend.get(key).await?;

        let swapped = match f(current.as_deref())? {
            Update::Keep => return Ok(false),
            Update::Put(new) => {
                backend
                    .compare_and_swap(key, current.as_deref(), Some(&new), ttl)
                    .await?
            }
            Update::Delete => {
                if current.is_none() {
                    return Ok(false);
                }
                backend
                    .compare_and_swap(key, current.as_deref(), None, None)
                    .await?
            }
        };

        if swapped {
            return Ok(true);
        }

        debug!(key, attempt, "concurrent write detected; retrying update");
        tokio::task::yield_now().await;
    }

    Err(BackendError::Contention(key.to_string()))
}

/// Key layout shared by every component.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn execution(&self, execution_id: &str) -> String {
        format!("{}:execution:{}", self.prefix, execution_id)
    }

    pub fn workflow_index(&self, workflow_id: &str) -> String {
        format!("{}:workflow:{}:executions", self.prefix, workflow_id)
    }

    pub fn checkpoint(&self, checkpoint_id: &str) -> String {
        format!("{}:checkpoint:{}", self.prefix, checkpoint_id)
    }

    pub fn lock(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }

    pub fn cache(&self, fingerprint: &str) -> String {
        format!("{}:cache:{}", self.prefix, fingerprint)
    }

    /// Ready/delayed/active/finished id lists of the job queue.
    pub fn queue_index(&self) -> String {
        format!("{}:queue:index", self.prefix)
    }

    pub fn queue_job(&self, queue_job_id: &str) -> String {
        format!("{}:queue:job:{}", self.prefix, queue_job_id)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("pipedag")
    }
}

/// Open the backend named by `[backend].url`.
pub async fn connect(settings: &BackendSection) -> BackendResult<Arc<dyn KvBackend>> {
    if settings.url.starts_with("memory://") {
        info!("using in-process memory backend");
        return Ok(Arc::new(MemoryBackend::new()));
    }

    let backend = RedisBackend::connect(&settings.url).await?;
    info!(url = %settings.url, "connected to redis backend");
    Ok(Arc::new(backend))
}
