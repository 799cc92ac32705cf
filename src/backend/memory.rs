// src/backend/memory.rs

//! In-process backend.
//!
//! Used by the single-process CLI mode and by the test-suite. Expiry is
//! measured with `tokio::time::Instant`, so `tokio::time::pause()` and
//! `advance()` drive TTLs deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::KvBackend;
use crate::errors::BackendResult;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Cheap to clone; clones share the same keyspace, like several clients of
/// one server.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (test helper).
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Live keys starting with `prefix`, sorted (test helper).
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.is_live(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

fn live_value<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a str> {
    let expired = entries.get(key).is_some_and(|e| !e.is_live(now));
    if expired {
        entries.remove(key);
        return None;
    }
    entries.get(key).map(|e| e.value.as_str())
}

fn expiry(ttl: Option<Duration>, now: Instant) -> Option<Instant> {
    ttl.map(|ttl| now + ttl)
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(live_value(&mut entries, key, now).map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> BackendResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let existed = live_value(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if live_value(&mut entries, key, now) != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: expiry(ttl, now),
                    },
                );
            }
            None => {
                entries.remove(key);
            }
        }

        Ok(true)
    }

    async fn ping(&self) -> BackendResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_swap_requires_matching_value() {
        let backend = MemoryBackend::new();

        assert!(backend.compare_and_swap("k", None, Some("a"), None).await.unwrap());
        assert!(!backend.compare_and_swap("k", None, Some("b"), None).await.unwrap());
        assert!(!backend.compare_and_swap("k", Some("x"), Some("b"), None).await.unwrap());
        assert!(backend.compare_and_swap("k", Some("a"), Some("b"), None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("b"));

        assert!(backend.compare_and_swap("k", Some("b"), None, None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v", Some(Duration::from_millis(100)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(backend.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(backend.get("k").await.unwrap().is_none());

        // An expired key counts as absent for set-if-absent.
        assert!(backend.set_if_absent("k", "w", None).await.unwrap());
    }
}
