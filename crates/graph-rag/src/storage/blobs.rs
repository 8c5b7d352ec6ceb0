//! Object store for document inputs, extracted images and KB exports

use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Blob storage addressed by generated ids
///
/// Implementations:
/// - `LocalObjectStore`: local filesystem
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under an id, replacing any previous content
    async fn put(&self, id: Uuid, data: &[u8]) -> Result<()>;

    /// Read the bytes of a blob
    async fn get(&self, id: Uuid) -> Result<Vec<u8>>;

    async fn exists(&self, id: Uuid) -> Result<bool>;

    /// Delete a blob; deleting a missing blob is not an error
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Store bytes under a fresh id
    async fn put_new(&self, data: &[u8]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.put(id, data).await?;
        Ok(id)
    }

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Object store in a local directory, one file per blob
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        self.root.join(format!("{}.bin", id))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, id: Uuid, data: &[u8]) -> Result<()> {
        // Write then rename so a crashed worker never leaves a torn blob
        let path = self.blob_path(id);
        let staging = self.root.join(format!("{}.part", id));
        tokio::fs::write(&staging, data).await?;
        tokio::fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Vec<u8>> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found("blob", id)),
            Err(e) => Err(Error::storage(format!("Failed to read blob {}: {}", id, e))),
        }
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(id)).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage(format!("Failed to delete blob {}: {}", id, e))),
        }
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("blobs")).unwrap();

        let id = store.put_new(b"hello").await.unwrap();
        assert!(store.exists(id).await.unwrap());
        assert_eq!(store.get(id).await.unwrap(), b"hello");

        store.put(id, b"replaced").await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), b"replaced");

        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(!store.exists(id).await.unwrap());
        assert!(matches!(store.get(id).await, Err(Error::NotFound { .. })));
    }
}
