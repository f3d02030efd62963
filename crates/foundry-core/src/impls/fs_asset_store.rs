//! Filesystem asset store.
//!
//! Files land in `<output_root>/<assets_dir>/<filename>`; the returned path is
//! relative to `output_root` so it can be handed to the commit collaborator
//! as-is.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use ulid::Ulid;

use crate::error::WriteError;
use crate::ports::AssetStore;

pub struct FsAssetStore {
    output_root: PathBuf,
    assets_dir: PathBuf,
}

impl FsAssetStore {
    pub fn new(output_root: impl Into<PathBuf>, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            assets_dir: assets_dir.into(),
        }
    }

    pub fn directory(&self) -> PathBuf {
        self.output_root.join(&self.assets_dir)
    }
}

fn store_err(path: &Path, source: std::io::Error) -> WriteError {
    WriteError::Store {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn put(&self, filename: &str, bytes: &[u8]) -> Result<String, WriteError> {
        let dir = self.directory();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| store_err(&dir, e))?;

        let dest = dir.join(filename);
        // Staged next to the target so the rename stays on one filesystem.
        let staged = dir.join(format!(".{filename}.{}.tmp", Ulid::new()));
        fs::write(&staged, bytes)
            .await
            .map_err(|e| store_err(&staged, e))?;
        if let Err(e) = fs::rename(&staged, &dest).await {
            let _ = fs::remove_file(&staged).await;
            return Err(store_err(&dest, e));
        }

        let relative = self.assets_dir.join(filename);
        Ok(relative.to_string_lossy().replace('\\', "/"))
    }
}
