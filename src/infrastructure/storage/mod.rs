pub mod cdn;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Media bucket seen by the pipeline.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> StorageResult<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// All keys under `prefix`, in listing order.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Reference handed to external services that read the object themselves.
    fn uri(&self, key: &str) -> String;
}
