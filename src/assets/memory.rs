//! In-process asset store.

use super::AssetStore;
use crate::error::AssetError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryAssetStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn put(&self, path: &str, blob: Vec<u8>) -> Result<(), AssetError> {
        self.blobs.write().await.insert(path.to_string(), blob);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(path.to_string()))
    }
}
