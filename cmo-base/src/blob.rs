//! Object-store implementations for externalized payloads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use cmo_core::traits::ObjectStore;
use cmo_core::CheckpointError;

/// In-process blob store for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// An empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ObjectStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CheckpointError> {
        self.blobs.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| CheckpointError::BlobMissing(key.to_string()))
    }
}

/// Filesystem-backed blob store. Keys map onto paths below the root; key
/// segments are content hashes, so writes never contend.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// A store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        // Keys are internal (`payload/<hex>`), but refuse traversal anyway.
        if key.contains("..") || key.starts_with('/') {
            return Err(CheckpointError::Store(format!("invalid blob key `{key}`")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CheckpointError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckpointError::Store(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CheckpointError::Store(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CheckpointError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::BlobMissing(key.to_string()))
            }
            Err(e) => Err(CheckpointError::Store(e.to_string())),
        }
    }
}

/// Build a blob store from a `blob_store_url` setting: `memory://` or
/// `file://<dir>`.
pub fn blob_store_from_url(url: &str) -> Result<Arc<dyn ObjectStore>, CheckpointError> {
    if url == "memory://" {
        return Ok(MemoryBlobStore::new());
    }
    if let Some(dir) = url.strip_prefix("file://") {
        return Ok(Arc::new(LocalBlobStore::new(dir)));
    }
    Err(CheckpointError::Store(format!(
        "unsupported blob store url `{url}`"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_round_trip_and_missing() {
        let store = MemoryBlobStore::new();
        store.put("payload/abc", b"bytes").await.unwrap();
        assert_eq!(store.get("payload/abc").await.unwrap(), b"bytes");
        assert_eq!(
            store.get("payload/missing").await.unwrap_err().code(),
            "blob_missing"
        );
    }

    #[tokio::test]
    async fn local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store.put("payload/abc", b"bytes").await.unwrap();
        assert_eq!(store.get("payload/abc").await.unwrap(), b"bytes");
        assert_eq!(
            store.get("payload/absent").await.unwrap_err().code(),
            "blob_missing"
        );
    }

    #[test]
    fn url_dispatch() {
        assert!(blob_store_from_url("memory://").is_ok());
        assert!(blob_store_from_url("file:///tmp/blobs").is_ok());
        assert!(blob_store_from_url("s3://bucket").is_err());
    }
}
