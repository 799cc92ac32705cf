// src/lock.rs

//! Distributed locks on top of the shared backend.
//!
//! A lock is a JSON [`LockInfo`] record stored under `{prefix}:lock:{resource}`
//! with the lock TTL as the key's expiry:
//!
//! - acquisition is a single set-if-absent, so two callers can never both win;
//! - release and extension compare the stored record before touching it, so a
//!   slow owner whose lock expired cannot release someone else's lock.
//!
//! Acquisition never blocks. Callers that want to wait use
//! [`LockManager::acquire_with_retry`] or their own backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{KeySpace, KvBackend, Update, compare_and_update};
use crate::config::model::LockSection;
use crate::errors::{BackendError, EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub resource: String,
    pub lock_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    backend: Arc<dyn KvBackend>,
    keys: KeySpace,
    settings: LockSection,
}

impl LockManager {
    pub fn new(backend: Arc<dyn KvBackend>, keys: KeySpace, settings: LockSection) -> Self {
        Self {
            backend,
            keys,
            settings,
        }
    }

    /// Try once to take the lock. Returns the new lock id, or `None` if the
    /// resource is already locked.
    pub async fn acquire_lock(
        &self,
        resource: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<String>> {
        let ttl = ttl.unwrap_or(Duration::from_millis(self.settings.default_ttl_ms));
        let now = Utc::now();
        let info = LockInfo {
            resource: resource.to_string(),
            lock_id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + chrono_duration(ttl),
        };
        let record = serde_json::to_string(&info).map_err(BackendError::from)?;

        let acquired = self
            .backend
            .set_if_absent(&self.keys.lock(resource), &record, Some(ttl))
            .await?;

        if acquired {
            debug!(resource, owner, lock_id = %info.lock_id, ttl_ms = ttl.as_millis() as u64, "lock acquired");
            Ok(Some(info.lock_id))
        } else {
            debug!(resource, owner, "lock already held");
            Ok(None)
        }
    }

    /// Acquire with the configured number of attempts and fixed delay.
    ///
    /// Exhaustion is reported as [`EngineError::LockContention`].
    pub async fn acquire_with_retry(
        &self,
        resource: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> Result<String> {
        let attempts = self.settings.retry_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(lock_id) = self.acquire_lock(resource, owner, ttl).await? {
                return Ok(lock_id);
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
            }
        }

        warn!(resource, owner, attempts, "giving up on lock acquisition");
        Err(EngineError::LockContention(resource.to_string()))
    }

    /// Release the lock if `lock_id` still identifies the current holder.
    pub async fn release_lock(&self, resource: &str, lock_id: &str) -> Result<bool> {
        let released = compare_and_update(
            self.backend.as_ref(),
            &self.keys.lock(resource),
            None,
            |current| match parse_lock(current)? {
                Some(info) if info.lock_id == lock_id => Ok(Update::Delete),
                _ => Ok(Update::Keep),
            },
        )
        .await?;

        if released {
            debug!(resource, lock_id, "lock released");
        } else {
            warn!(resource, lock_id, "release ignored: lock not held by this id");
        }
        Ok(released)
    }

    /// Push the expiry of a held lock forward by `extension`.
    pub async fn extend_lock(&self, resource: &str, lock_id: &str, extension: Duration) -> Result<bool> {
        let key = self.keys.lock(resource);
        let mut new_ttl = None;

        // The TTL depends on the record we read, so the write goes through a
        // hand-rolled CAS rather than `compare_and_update`.
        for _ in 0..crate::backend::MAX_CAS_ATTEMPTS {
            let current = self.backend.get(&key).await?;
            let Some(mut info) = parse_lock(current.as_deref())? else {
                return Ok(false);
            };
            if info.lock_id != lock_id {
                return Ok(false);
            }

            info.expires_at += chrono_duration(extension);
            let remaining = (info.expires_at - Utc::now())
                .to_std()
                .unwrap_or(extension);
            let record = serde_json::to_string(&info).map_err(BackendError::from)?;

            if self
                .backend
                .compare_and_swap(&key, current.as_deref(), Some(&record), Some(remaining))
                .await?
            {
                new_ttl = Some(remaining);
                break;
            }
        }

        match new_ttl {
            Some(ttl) => {
                debug!(resource, lock_id, ttl_ms = ttl.as_millis() as u64, "lock extended");
                Ok(true)
            }
            None => Err(BackendError::Contention(key).into()),
        }
    }

    pub async fn get_lock(&self, resource: &str) -> Result<Option<LockInfo>> {
        let raw = self.backend.get(&self.keys.lock(resource)).await?;
        Ok(parse_lock(raw.as_deref())?)
    }

    /// Run `f` while holding `resource`, releasing afterwards.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, owner: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lock_id = self.acquire_with_retry(resource, owner, None).await?;
        info!(resource, owner, "entered critical section");

        let outcome = f().await;

        if let Err(e) = self.release_lock(resource, &lock_id).await {
            warn!(resource, error = %e, "failed to release lock; it will expire on its own");
        }
        outcome
    }
}

fn parse_lock(raw: Option<&str>) -> std::result::Result<Option<LockInfo>, BackendError> {
    raw.map(serde_json::from_str::<LockInfo>)
        .transpose()
        .map_err(BackendError::from)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
