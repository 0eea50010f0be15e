//! Asset storage for captured pages.
//!
//! The fetcher writes a page's assets once under the analysis asset path;
//! every analyzer reads them back. Blobs are opaque bytes keyed by a
//! relative path.

pub mod fs;
pub mod memory;

use crate::error::AssetError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fs::FsAssetStore;
pub use memory::MemoryAssetStore;

/// File name of the serialized bundle inside an analysis asset path.
pub const BUNDLE_FILE: &str = "bundle.json";

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn put(&self, path: &str, blob: Vec<u8>) -> Result<(), AssetError>;

    /// Returns [`AssetError::NotFound`] when nothing was stored at `path`.
    async fn get(&self, path: &str) -> Result<Vec<u8>, AssetError>;
}

/// Kind of a sub-resource referenced by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Script,
    Stylesheet,
    Image,
}

/// A sub-resource referenced by the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub url: String,
}

/// Everything captured for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBundle {
    /// URL that was requested.
    pub target_url: String,
    /// URL after redirects.
    pub final_url: String,
    pub http_status: u16,
    pub content_type: Option<String>,
    pub html: String,
    pub resources: Vec<ResourceRef>,
    /// Rendered screenshot, when the capturer produces one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Vec<u8>>,
    pub fetched_at: DateTime<Utc>,
    /// Time to receive the full document.
    pub elapsed_ms: u64,
}

impl AssetBundle {
    /// Size of the HTML document in bytes.
    pub fn html_bytes(&self) -> usize {
        self.html.len()
    }

    #[cfg(test)]
    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceRef> {
        self.resources.iter().filter(move |r| r.kind == kind)
    }
}

fn bundle_path(asset_path: &str) -> String {
    format!("{}/{}", asset_path.trim_end_matches('/'), BUNDLE_FILE)
}

/// Persist a bundle under an analysis asset path.
pub async fn save_bundle(
    store: &dyn AssetStore,
    asset_path: &str,
    bundle: &AssetBundle,
) -> Result<(), AssetError> {
    let blob = serde_json::to_vec(bundle)?;
    store.put(&bundle_path(asset_path), blob).await
}

/// Load the bundle stored under an analysis asset path.
pub async fn load_bundle(store: &dyn AssetStore, asset_path: &str) -> Result<AssetBundle, AssetError> {
    let blob = store.get(&bundle_path(asset_path)).await?;
    Ok(serde_json::from_slice(&blob)?)
}

#[cfg(test)]
pub(crate) fn sample_bundle(html: &str) -> AssetBundle {
    AssetBundle {
        target_url: "https://example.com/".to_string(),
        final_url: "https://example.com/".to_string(),
        http_status: 200,
        content_type: Some("text/html; charset=utf-8".to_string()),
        html: html.to_string(),
        resources: Vec::new(),
        snapshot: None,
        fetched_at: Utc::now(),
        elapsed_ms: 120,
    }
}
