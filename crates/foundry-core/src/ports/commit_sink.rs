//! CommitSink port - external durable-storage / versioning collaborator.
//!
//! Called after a task is recorded as completed. A failure here is logged by
//! the caller and never changes the task status.

use async_trait::async_trait;

use crate::domain::TaskId;
use crate::error::CommitError;

#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn commit(&self, paths: &[String], task_id: &TaskId, title: &str)
    -> Result<(), CommitError>;
}
