//! Segment storage
//!
//! The segmenter talks to storage through a narrow put/get/delete interface;
//! paths are opaque strings of the form `{streamKey}/segment_{N}.m4s`. Each
//! object is written exactly once and deleted on window eviction. Concurrent
//! writes always target distinct paths.

pub mod local;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

pub use local::LocalStorage;

/// Object storage abstraction
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write an object, creating parent directories as needed.
    async fn put(&self, path: &str, data: Bytes) -> Result<(), StorageError>;

    /// Read an object in full.
    async fn get(&self, path: &str) -> Result<Bytes, StorageError>;

    /// Delete an object; deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Check object existence.
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    /// List object names directly under a prefix.
    async fn list(&self, dir: &str) -> Result<Vec<String>, StorageError>;
}
