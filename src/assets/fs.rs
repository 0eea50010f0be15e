//! Filesystem asset store rooted at a directory.

use super::AssetStore;
use crate::error::AssetError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

pub struct FsAssetStore {
    root: PathBuf,
}

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative asset path inside the root.
    ///
    /// Absolute paths and `..` components are rejected so a path can never
    /// escape the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, AssetError> {
        let relative = Path::new(path);
        if path.is_empty() {
            return Err(AssetError::InvalidPath(path.to_string()));
        }

        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(AssetError::InvalidPath(path.to_string())),
            }
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn put(&self, path: &str, blob: Vec<u8>) -> Result<(), AssetError> {
        let full_path = self.resolve(path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename, so readers never see a
        // partially written blob.
        let tmp_path = full_path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &blob).await?;
        tokio::fs::rename(&tmp_path, &full_path).await?;

        debug!("Stored {} bytes at {}", blob.len(), full_path.display());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        let full_path = self.resolve(path)?;
        match tokio::fs::read(&full_path).await {
            Ok(blob) => Ok(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AssetError::NotFound(path.to_string()))
            }
            Err(e) => Err(AssetError::Io(e)),
        }
    }
}
