//! Result handoff to an object store
//!
//! Results are addressed by job id (`results/{job_id}.png`) and carry the
//! SHA-256 of the stored bytes so consumers can verify what they fetch.

use crate::error::{Result, TryOnError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where a result ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResult {
    /// Store-relative key
    pub key: String,
    /// URL or path a client can fetch the result from
    pub location: String,
    /// Hex SHA-256 of the stored bytes
    pub sha256: String,
    pub size_bytes: u64,
}

/// Key under which a job's result is stored
#[must_use]
pub fn result_key(job_id: Uuid) -> String {
    format!("results/{job_id}.png")
}

/// Hex-encoded SHA-256 digest
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Destination for finished results
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist PNG bytes for `job_id`
    async fn put(&self, job_id: Uuid, png: Vec<u8>) -> Result<StoredResult>;
}

/// Stores results as files below a root directory
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
    base_url: Option<String>,
}

impl FilesystemStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            base_url: None,
        }
    }

    /// Report locations as `{base_url}/{key}` instead of file paths
    #[must_use]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ResultStore for FilesystemStore {
    async fn put(&self, job_id: Uuid, png: Vec<u8>) -> Result<StoredResult> {
        let key = result_key(job_id);
        let path = self.root.join(&key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TryOnError::storage(format!("{}: {e}", parent.display())))?;
        }

        let sha256 = sha256_hex(&png);
        let size_bytes = png.len() as u64;
        // Write then rename so readers never see a partial file
        let staging = path.with_extension("png.partial");
        tokio::fs::write(&staging, &png)
            .await
            .map_err(|e| TryOnError::storage(format!("{}: {e}", staging.display())))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| TryOnError::storage(format!("{}: {e}", path.display())))?;

        let location = match &self.base_url {
            Some(base) => format!("{base}/{key}"),
            None => path.display().to_string(),
        };
        tracing::debug!(%job_id, %location, size_bytes, "stored result");
        Ok(StoredResult {
            key,
            location,
            sha256,
            size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_result_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            result_key(id),
            "results/00000000-0000-0000-0000-000000000000.png"
        );
    }

    #[tokio::test]
    async fn test_filesystem_store_writes_content_addressed_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path());
        let id = Uuid::new_v4();
        let stored = store.put(id, b"png-bytes".to_vec()).await.unwrap();

        assert_eq!(stored.key, result_key(id));
        assert_eq!(stored.size_bytes, 9);
        assert_eq!(stored.sha256, sha256_hex(b"png-bytes"));
        let on_disk = std::fs::read(dir.path().join(&stored.key)).unwrap();
        assert_eq!(on_disk, b"png-bytes");
        assert!(!dir.path().join(&stored.key).with_extension("png.partial").exists());
    }

    #[tokio::test]
    async fn test_base_url_locations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path()).with_base_url("https://cdn.example.com/");
        let id = Uuid::new_v4();
        let stored = store.put(id, vec![1, 2, 3]).await.unwrap();
        assert_eq!(stored.location, format!("https://cdn.example.com/results/{id}.png"));
    }
}
