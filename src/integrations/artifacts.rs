use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::ArtifactStore;

/// Writes artifacts under `<root>/<run_id>/`.
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn save_run_summary(&self, run_id: &str, markdown: &str) -> Result<String> {
        let dir = self.root.join(run_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifact directory {}", dir.display()))?;
        let path = dir.join("summary.md");
        tokio::fs::write(&path, markdown)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path.display().to_string())
    }
}
