//! QueueStore port - the common contract every queue backend satisfies.
//!
//! Backends: `DirectoryQueue` (files + atomic rename), `StreamQueue` (Redis
//! stream + consumer group) and `MemoryQueue` (in-process, tests/embedding).
//! Workers only ever hold an `Arc<dyn QueueStore>`.
//!
//! # Guarantees
//! - `claim` hands a given task to exactly one caller. A backend rejects the
//!   second claimant rather than serving a stale copy.
//! - A task id lives in exactly one partition (pending / processing /
//!   completed / failed) and readers never see a torn record.
//! - `complete` / `fail` only succeed from `processing`; a second terminal
//!   call yields `NotFound` and leaves the stored record untouched.
//! - Nothing in the core deletes a terminal record.

use std::time::Duration;

use async_trait::async_trait;

use crate::app::status::QueueCounts;
use crate::domain::{NewTask, Role, TaskId, TaskRecord, TaskResult, TaskStatus};
use crate::error::QueueError;

/// A task sitting in the processing partition, as seen by a recovery scan.
///
/// `embedded_status` is whatever the record body says; for the directory
/// backend it can still read `pending` if the claimant crashed between the
/// rename and the rewrite. The partition is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrandedTask {
    pub id: TaskId,
    pub role: Role,
    pub embedded_status: TaskStatus,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Backend label for logs.
    fn backend(&self) -> &'static str;

    /// Persist a new task in `pending`.
    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, QueueError>;

    /// Atomically move the oldest (best effort) pending task of `role` to
    /// `processing` and return it. `None` when nothing matches.
    async fn claim(&self, role: &Role) -> Result<Option<TaskRecord>, QueueError>;

    /// `processing -> completed`.
    async fn complete(&self, id: &TaskId, result: TaskResult) -> Result<TaskRecord, QueueError>;

    /// `processing -> failed`.
    async fn fail(&self, id: &TaskId, error: &str) -> Result<TaskRecord, QueueError>;

    /// Read-only lookup; the returned status reflects the authoritative
    /// partition.
    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError>;

    /// Per-partition totals.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Tasks currently in `processing`. Never mutates anything: tasks left
    /// behind by a crashed worker need external intervention (or, for the
    /// stream backend, the reclaim pass).
    async fn stranded(&self) -> Result<Vec<StrandedTask>, QueueError>;

    /// Redeliver `role` tasks whose claim has been idle longer than
    /// `min_idle`. Backends without a redelivery mechanism return nothing.
    async fn reclaim_stale(&self, role: &Role, min_idle: Duration) -> Result<Vec<TaskId>, QueueError> {
        let _ = (role, min_idle);
        Ok(Vec::new())
    }
}
