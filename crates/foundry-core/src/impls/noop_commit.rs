//! Commit sink that only logs. The default when no version-control
//! collaborator is wired in.

use async_trait::async_trait;

use crate::domain::TaskId;
use crate::error::CommitError;
use crate::ports::CommitSink;

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCommitSink;

#[async_trait]
impl CommitSink for NoopCommitSink {
    async fn commit(&self, paths: &[String], task_id: &TaskId, title: &str) -> Result<(), CommitError> {
        tracing::debug!(task_id = %task_id, title, files = paths.len(), "commit skipped (no sink configured)");
        Ok(())
    }
}
