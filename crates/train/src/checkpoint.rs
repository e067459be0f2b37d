//! Tag-addressed checkpoints: one safetensors snapshot per tag.

use std::path::{Path, PathBuf};

use anyhow::Context;
use squeeze_core::Runtime;

/// Checkpoint saved before the search starts; the first rollback target.
pub const PRETRAINED: &str = "pretrained";
/// Checkpoint written on interrupt and by lifecycle commands.
pub const LATEST: &str = "latest";

const EXTENSION: &str = "safetensors";

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    directory: PathBuf,
}

impl CheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path(&self, tag: &str) -> PathBuf {
        self.directory.join(format!("{tag}.{EXTENSION}"))
    }

    pub fn exists(&self, tag: &str) -> bool {
        self.path(tag).is_file()
    }

    /// Snapshot every cell of `runtime` under `tag`.
    pub fn save(&self, runtime: &Runtime, tag: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.directory)
            .with_context(|| format!("creating {}", self.directory.display()))?;
        let path = self.path(tag);
        runtime
            .save(&path)
            .with_context(|| format!("saving checkpoint {tag:?}"))?;
        tracing::debug!(tag, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Restore `runtime` from the snapshot saved under `tag`.
    pub fn load(&self, runtime: &Runtime, tag: &str) -> anyhow::Result<()> {
        let path = self.path(tag);
        if !path.is_file() {
            anyhow::bail!("checkpoint {tag:?} not found at {}", path.display());
        }
        let restored = runtime
            .load(&path)
            .with_context(|| format!("loading checkpoint {tag:?}"))?;
        tracing::debug!(tag, restored, "checkpoint loaded");
        Ok(())
    }

    /// Tags present in the directory, sorted.
    pub fn tags(&self) -> anyhow::Result<Vec<String>> {
        if !self.directory.is_dir() {
            return Ok(Vec::new());
        }
        let mut tags = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    tags.push(stem.to_string());
                }
            }
        }
        tags.sort();
        Ok(tags)
    }
}
