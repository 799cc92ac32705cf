// src/queue/store.rs

//! Queue persistence on top of [`KvBackend`].
//!
//! Two kinds of keys:
//!
//! - `{prefix}:queue:index`: the [`QueueIndex`], i.e. which job is in which
//!   stage. Claiming, finishing and retrying are single compare-and-swaps on
//!   this key, so two workers can never claim the same job.
//! - `{prefix}:queue:job:{id}`: one [`QueueJobRecord`] per job.
//!
//! Neither carries a TTL: live jobs must survive as long as it takes, and
//! finished ones are removed by the retention limits.

use std::sync::Arc;

use crate::backend::{KeySpace, KvBackend, Update, compare_and_update};
use crate::errors::{BackendError, BackendResult};

use super::record::{QueueIndex, QueueJobRecord};

#[derive(Debug, Clone)]
pub(crate) struct QueueStore {
    backend: Arc<dyn KvBackend>,
    keys: KeySpace,
}

impl QueueStore {
    pub(crate) fn new(backend: Arc<dyn KvBackend>, keys: KeySpace) -> Self {
        Self { backend, keys }
    }

    pub(crate) fn backend(&self) -> &dyn KvBackend {
        self.backend.as_ref()
    }

    pub(crate) async fn index(&self) -> BackendResult<QueueIndex> {
        let raw = self.backend.get(&self.keys.queue_index()).await?;
        parse_index(raw.as_deref())
    }

    /// Atomic read-modify-write of the index.
    ///
    /// `f` returns a value and whether the index must be written. The value
    /// of the run that finally landed (or decided not to write) is returned.
    pub(crate) async fn update_index<T, F>(&self, mut f: F) -> BackendResult<T>
    where
        T: Send,
        F: FnMut(&mut QueueIndex) -> (T, bool) + Send,
    {
        let mut out = None;
        compare_and_update(self.backend.as_ref(), &self.keys.queue_index(), None, |current| {
            let mut index = parse_index(current)?;
            let (value, write) = f(&mut index);
            out = Some(value);
            if write {
                Ok(Update::Put(serde_json::to_string(&index)?))
            } else {
                Ok(Update::Keep)
            }
        })
        .await?;

        out.ok_or_else(|| BackendError::Unavailable("queue index update did not run".to_string()))
    }

    pub(crate) async fn get(&self, id: &str) -> BackendResult<Option<QueueJobRecord>> {
        let raw = self.backend.get(&self.keys.queue_job(id)).await?;
        Ok(raw
            .as_deref()
            .map(serde_json::from_str::<QueueJobRecord>)
            .transpose()?)
    }

    pub(crate) async fn put(&self, record: &QueueJobRecord) -> BackendResult<()> {
        let raw = serde_json::to_string(record)?;
        self.backend
            .set(&self.keys.queue_job(&record.id), &raw, None)
            .await
    }

    /// Atomic read-modify-write of one record. `f` returns whether it changed
    /// anything. Returns the record as written, or `None` if the record is
    /// missing or `f` left it alone.
    pub(crate) async fn update<F>(&self, id: &str, mut f: F) -> BackendResult<Option<QueueJobRecord>>
    where
        F: FnMut(&mut QueueJobRecord) -> bool + Send,
    {
        let mut written = None;
        compare_and_update(self.backend.as_ref(), &self.keys.queue_job(id), None, |current| {
            written = None;
            let Some(raw) = current else {
                return Ok(Update::Keep);
            };
            let mut record: QueueJobRecord = serde_json::from_str(raw)?;
            if !f(&mut record) {
                return Ok(Update::Keep);
            }
            let raw = serde_json::to_string(&record)?;
            written = Some(record);
            Ok(Update::Put(raw))
        })
        .await?;
        Ok(written)
    }

    pub(crate) async fn delete(&self, id: &str) -> BackendResult<bool> {
        self.backend.delete(&self.keys.queue_job(id)).await
    }
}

fn parse_index(raw: Option<&str>) -> BackendResult<QueueIndex> {
    Ok(raw
        .map(serde_json::from_str::<QueueIndex>)
        .transpose()?
        .unwrap_or_default())
}
