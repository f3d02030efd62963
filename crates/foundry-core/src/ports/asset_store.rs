//! AssetStore port - where normalised images land.
//!
//! The store receives encoded bytes plus a file name and answers with the
//! relative path that later goes into the task result and the commit.

use async_trait::async_trait;

use crate::error::WriteError;

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Persist `bytes` under `filename`; returns the relative path.
    async fn put(&self, filename: &str, bytes: &[u8]) -> Result<String, WriteError>;
}
