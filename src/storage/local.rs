//! Local filesystem storage

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use super::Storage;
use crate::error::StorageError;

/// Storage rooted at a local directory
pub struct LocalStorage {
    base_dir: PathBuf,
}

impl LocalStorage {
    /// Create the backend, making sure the root directory exists.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| io_err(&base_dir, e))?;
        Ok(Self { base_dir })
    }

    /// Resolve an object path under the root, rejecting traversal.
    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(path);
        let traverses = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if traverses || path.is_empty() {
            return Err(StorageError::NotFound(path.to_string()));
        }
        Ok(self.base_dir.join(rel))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        tokio::fs::write(&full, &data)
            .await
            .map_err(|e| io_err(&full, e))
    }

    async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(io_err(&full, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&full, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await.unwrap_or(false))
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>, StorageError> {
        let full = self.resolve(dir)?;
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&full, e)),
        };

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, storage) = storage().await;
        let data = Bytes::from_static(b"segment bytes");

        storage.put("live1/segment_0.m4s", data.clone()).await.unwrap();
        let read = storage.get("live1/segment_0.m4s").await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, storage) = storage().await;
        let err = storage.get("live1/segment_9.m4s").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let (_dir, storage) = storage().await;
        storage.put("live1/init.mp4", Bytes::from_static(b"x")).await.unwrap();
        assert!(storage.exists("live1/init.mp4").await.unwrap());

        storage.delete("live1/init.mp4").await.unwrap();
        assert!(!storage.exists("live1/init.mp4").await.unwrap());

        // Deleting again is fine
        storage.delete("live1/init.mp4").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_directory() {
        let (_dir, storage) = storage().await;
        storage.put("live1/segment_0.m4s", Bytes::from_static(b"a")).await.unwrap();
        storage.put("live1/segment_1.m4s", Bytes::from_static(b"b")).await.unwrap();

        let names = storage.list("live1").await.unwrap();
        assert_eq!(names, vec!["segment_0.m4s", "segment_1.m4s"]);

        assert!(storage.list("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (_dir, storage) = storage().await;
        assert!(storage.get("../outside").await.is_err());
        assert!(storage.put("..", Bytes::new()).await.is_err());
    }
}
