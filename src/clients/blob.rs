// src/clients/blob.rs

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};

/// Put/get of uploaded file bytes by object key. Binary storage internals are
/// out of scope; everything downstream only sees opaque keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8], extension: Option<&str>) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed blob store. Keys are generated uuids, never derived from
/// client-supplied names.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys are single path components; anything else is a lookup bug.
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(PipelineError::BlobError(format!(
                "invalid blob key '{}'",
                key
            )));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: &[u8], extension: Option<&str>) -> Result<String> {
        let key = match extension {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = self.path_for(&key)?;

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PipelineError::BlobError(format!("failed to create blob root: {}", e)))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::BlobError(format!("failed to write blob '{}': {}", key, e)))?;

        debug!(key = %key, size = bytes.len(), "Stored blob");
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::BlobError(format!("failed to read blob '{}': {}", key, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let key = store.put(b"receipt bytes", Some("jpg")).await.unwrap();
        assert!(key.ends_with(".jpg"));

        let bytes = store.get(&key).await.unwrap();
        assert_eq!(bytes, b"receipt bytes");
    }

    #[tokio::test]
    async fn get_missing_key_is_blob_error() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let result = store.get("no-such-key").await;
        assert!(matches!(result, Err(PipelineError::BlobError(_))));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("a/b").await.is_err());
        assert!(store.get("").await.is_err());
    }
}
