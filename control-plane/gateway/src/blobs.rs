use std::{io, path::PathBuf};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob '{content_id}' not found")]
    NotFound { content_id: String },
    #[error("blob store io failure: {source}")]
    Io {
        #[source]
        source: io::Error,
    },
}

/// Content-addressed blob access. The storage engine itself is external; the
/// router only needs to fetch deployment bundles by content id.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, content_id: &str) -> Result<Vec<u8>, BlobError>;
    async fn put(&self, bytes: &[u8]) -> Result<String, BlobError>;
}

/// Filesystem-backed store under `{data_root}/blobs/{content_id}`.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(data_root: &std::path::Path) -> Self {
        Self {
            root: data_root.join("blobs"),
        }
    }

    fn path_for(&self, content_id: &str) -> PathBuf {
        self.root.join(content_id)
    }
}

#[must_use]
pub fn content_id_for(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, content_id: &str) -> Result<Vec<u8>, BlobError> {
        // Reject path-traversal shaped ids outright.
        if !content_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BlobError::NotFound {
                content_id: content_id.to_owned(),
            });
        }
        match tokio::fs::read(self.path_for(content_id)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(BlobError::NotFound {
                content_id: content_id.to_owned(),
            }),
            Err(source) => Err(BlobError::Io { source }),
        }
    }

    async fn put(&self, bytes: &[u8]) -> Result<String, BlobError> {
        let content_id = content_id_for(bytes);
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| BlobError::Io { source })?;
        tokio::fs::write(self.path_for(&content_id), bytes)
            .await
            .map_err(|source| BlobError::Io { source })?;
        Ok(content_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_by_content_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let content_id = store.put(b"<html>hello</html>").await.unwrap();
        assert_eq!(content_id, content_id_for(b"<html>hello</html>"));

        let bytes = store.get(&content_id).await.unwrap();
        assert_eq!(bytes, b"<html>hello</html>");
    }

    #[tokio::test]
    async fn missing_and_malformed_ids_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(matches!(
            store.get(&content_id_for(b"absent")).await,
            Err(BlobError::NotFound { .. })
        ));
        assert!(matches!(
            store.get("../../etc/passwd").await,
            Err(BlobError::NotFound { .. })
        ));
    }
}
