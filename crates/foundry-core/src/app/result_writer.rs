//! ResultWriter - persists pipeline output and hands it to the commit sink.
//!
//! # Design
//! - Every image is encoded as PNG and written through the `AssetStore`
//!   before the task result is built; a single failure aborts the task.
//! - `commit` runs after the task was recorded as completed. Its failure is
//!   logged and swallowed: the task stays completed.

use std::sync::Arc;

use crate::domain::{AssetDescriptor, TaskRecord, TaskResult, asset_filename};
use crate::error::WriteError;
use crate::pipeline::PipelineOutput;
use crate::pipeline::normalize::encode_png;
use crate::ports::{AssetStore, Clock, CommitSink};

pub struct ResultWriter {
    assets: Arc<dyn AssetStore>,
    commits: Arc<dyn CommitSink>,
    clock: Arc<dyn Clock>,
}

impl ResultWriter {
    pub fn new(assets: Arc<dyn AssetStore>, commits: Arc<dyn CommitSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            assets,
            commits,
            clock,
        }
    }

    /// Write every generated image and build the task result.
    pub async fn persist(&self, output: &PipelineOutput) -> Result<TaskResult, WriteError> {
        let mut descriptors = Vec::with_capacity(output.assets.len());

        for asset in &output.assets {
            let filename = asset_filename(&asset.request.description, self.clock.now());
            let bytes = encode_png(&asset.image).map_err(|e| WriteError::Encode {
                filename: filename.clone(),
                message: e.to_string(),
            })?;
            let path = self.assets.put(&filename, &bytes).await?;
            tracing::debug!(%path, provider = %asset.provider, "asset written");

            descriptors.push(AssetDescriptor {
                kind: asset.request.kind,
                prompt: asset.request.prompt.clone(),
                target_size: asset.request.size,
                description: asset.request.description.clone(),
                filename,
                path,
                provider: asset.provider.clone(),
            });
        }

        let duration_ms = u64::try_from(output.duration.as_millis()).unwrap_or(u64::MAX);
        Ok(TaskResult::new(descriptors, duration_ms, output.outcome))
    }

    /// Hand the written paths to the commit sink. Never fails the task.
    pub async fn commit(&self, result: &TaskResult, task: &TaskRecord) {
        let paths: Vec<String> = result.assets.iter().map(|a| a.path.clone()).collect();
        if paths.is_empty() {
            return;
        }
        if let Err(e) = self
            .commits
            .commit(&paths, task.id(), &task.payload().title)
            .await
        {
            tracing::warn!(task_id = %task.id(), error = %e, "commit failed; task stays completed");
        }
    }
}
