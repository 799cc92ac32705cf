// src/queue/record.rs

//! Persisted queue records and the shared queue index.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorCategory, ExecutionId, JobResult, JobSpec};

/// Lifecycle of a queued job.
///
/// `waiting | prioritized -> active -> completed | failed`, with `delayed`
/// between a failed attempt and its retry. Cancelled jobs are removed and
/// report `notFound`, as do finished jobs past the retention limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueJobStatus {
    Waiting,
    Prioritized,
    Delayed,
    Active,
    Completed,
    Failed,
    NotFound,
}

impl QueueJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueJobStatus::Completed | QueueJobStatus::Failed)
    }

    /// Still queued: eligible for cancellation.
    pub fn is_queued(self) -> bool {
        matches!(
            self,
            QueueJobStatus::Waiting | QueueJobStatus::Prioritized | QueueJobStatus::Delayed
        )
    }

    /// Status of a job entering the ready list.
    pub(crate) fn ready_for(priority: u8) -> Self {
        if priority > 0 {
            QueueJobStatus::Prioritized
        } else {
            QueueJobStatus::Waiting
        }
    }
}

impl fmt::Display for QueueJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueJobStatus::Waiting => "waiting",
            QueueJobStatus::Prioritized => "prioritized",
            QueueJobStatus::Delayed => "delayed",
            QueueJobStatus::Active => "active",
            QueueJobStatus::Completed => "completed",
            QueueJobStatus::Failed => "failed",
            QueueJobStatus::NotFound => "notFound",
        };
        f.write_str(s)
    }
}

/// What a caller hands to [`JobQueue::submit_job`](crate::queue::JobQueue::submit_job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub execution_id: ExecutionId,
    pub spec: JobSpec,
}

impl JobSubmission {
    pub fn new(execution_id: impl Into<ExecutionId>, spec: JobSpec) -> Self {
        Self {
            execution_id: execution_id.into(),
            spec,
        }
    }
}

/// One job as stored under `{prefix}:queue:job:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJobRecord {
    pub id: String,
    pub execution_id: ExecutionId,
    pub spec: JobSpec,
    pub status: QueueJobStatus,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    /// Final outcome, set once the job is terminal.
    pub outcome: Option<JobResult>,
    pub logs: Vec<String>,
    /// Worker running the current attempt.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Claim token of the current attempt; unique per attempt, unlike
    /// `worker_id` which several queues may share.
    #[serde(default)]
    pub claimed_by: Option<String>,
    /// Renewed by the worker while the attempt runs.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// When a delayed job becomes ready again.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// Set by an abort from another process; the owning worker stops the
    /// attempt on its next poll.
    #[serde(default)]
    pub abort_requested: Option<ErrorCategory>,
}

impl QueueJobRecord {
    pub(crate) fn new(id: String, submission: JobSubmission) -> Self {
        Self {
            id,
            execution_id: submission.execution_id,
            status: QueueJobStatus::ready_for(submission.spec.priority),
            spec: submission.spec,
            attempts_made: 0,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            outcome: None,
            logs: Vec::new(),
            worker_id: None,
            claimed_by: None,
            lease_expires_at: None,
            retry_at: None,
            abort_requested: None,
        }
    }

    pub(crate) fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    /// Queued jobs held back because the queue is paused.
    pub paused: usize,
}

/// Entry of the ready list. The type lets a worker skip jobs it has no
/// handler for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadyEntry {
    pub id: String,
    pub priority: u8,
    pub job_type: String,
}

impl ReadyEntry {
    pub(crate) fn of(record: &QueueJobRecord) -> Self {
        Self {
            id: record.id.clone(),
            priority: record.spec.priority,
            job_type: record.spec.job_type.clone(),
        }
    }
}

/// Which list of the index a job sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Ready,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// Every job id the queue knows about, by stage. Stored as one JSON value
/// under `{prefix}:queue:index` so that each transition is a single
/// compare-and-swap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueueIndex {
    /// Highest priority first, FIFO within a priority.
    #[serde(default)]
    pub ready: Vec<ReadyEntry>,
    #[serde(default)]
    pub delayed: Vec<String>,
    #[serde(default)]
    pub active: Vec<String>,
    /// Oldest first, trimmed to the retention limit.
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default)]
    pub paused: bool,
}

impl QueueIndex {
    /// Insert behind every entry of the same or higher priority.
    pub(crate) fn push_ready(&mut self, entry: ReadyEntry) {
        let at = self
            .ready
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, entry);
    }

    /// Move the first ready job `accepts` agrees to into the active list.
    pub(crate) fn claim(&mut self, accepts: impl Fn(&ReadyEntry) -> bool) -> Option<ReadyEntry> {
        if self.paused {
            return None;
        }
        let at = self.ready.iter().position(accepts)?;
        let entry = self.ready.remove(at);
        self.active.push(entry.id.clone());
        Some(entry)
    }

    pub(crate) fn stage_of(&self, id: &str) -> Option<Stage> {
        if self.ready.iter().any(|e| e.id == id) {
            Some(Stage::Ready)
        } else if self.delayed.iter().any(|d| d == id) {
            Some(Stage::Delayed)
        } else if self.active.iter().any(|a| a == id) {
            Some(Stage::Active)
        } else if self.completed.iter().any(|c| c == id) {
            Some(Stage::Completed)
        } else if self.failed.iter().any(|f| f == id) {
            Some(Stage::Failed)
        } else {
            None
        }
    }

    /// Drop `id` from whichever list holds it. Returns the stage it was in.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Stage> {
        let stage = self.stage_of(id)?;
        match stage {
            Stage::Ready => self.ready.retain(|e| e.id != id),
            Stage::Delayed => self.delayed.retain(|d| d != id),
            Stage::Active => self.active.retain(|a| a != id),
            Stage::Completed => self.completed.retain(|c| c != id),
            Stage::Failed => self.failed.retain(|f| f != id),
        }
        Some(stage)
    }

    /// Record `id` as finished. Returns the ids that fell out of retention.
    pub(crate) fn push_finished(&mut self, id: &str, success: bool, retain: usize) -> Vec<String> {
        let list = if success {
            &mut self.completed
        } else {
            &mut self.failed
        };
        list.push(id.to_string());
        let excess = list.len().saturating_sub(retain);
        list.drain(..excess).collect()
    }

    pub(crate) fn queued(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, priority: u8) -> ReadyEntry {
        ReadyEntry {
            id: id.to_string(),
            priority,
            job_type: "noop".to_string(),
        }
    }

    #[test]
    fn ready_list_orders_by_priority_then_fifo() {
        let mut index = QueueIndex::default();
        for (id, priority) in [("a", 0), ("b", 5), ("c", 5), ("d", 10)] {
            index.push_ready(entry(id, priority));
        }

        let order: Vec<String> = std::iter::from_fn(|| index.claim(|_| true).map(|e| e.id)).collect();
        assert_eq!(order, vec!["d", "b", "c", "a"]);
        assert_eq!(index.active, vec!["d", "b", "c", "a"]);
    }

    #[test]
    fn claim_skips_types_the_worker_cannot_run_and_respects_pause() {
        let mut index = QueueIndex::default();
        index.push_ready(ReadyEntry {
            job_type: "gpu".to_string(),
            ..entry("x", 9)
        });
        index.push_ready(entry("y", 1));

        index.paused = true;
        assert!(index.claim(|_| true).is_none());

        index.paused = false;
        let claimed = index.claim(|e| e.job_type == "noop").unwrap();
        assert_eq!(claimed.id, "y");
        assert_eq!(index.stage_of("x"), Some(Stage::Ready));
        assert_eq!(index.stage_of("y"), Some(Stage::Active));
    }

    #[test]
    fn finished_lists_are_trimmed_oldest_first() {
        let mut index = QueueIndex::default();
        assert!(index.push_finished("1", true, 2).is_empty());
        assert!(index.push_finished("2", true, 2).is_empty());
        assert_eq!(index.push_finished("3", true, 2), vec!["1"]);
        assert_eq!(index.completed, vec!["2", "3"]);
        assert_eq!(index.remove("2"), Some(Stage::Completed));
        assert_eq!(index.remove("2"), None);
    }
}
