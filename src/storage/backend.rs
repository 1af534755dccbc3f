//! Object store trait definition.
//!
//! Abstraction over the durable blob store that holds sample content keyed
//! by its hex digest. Backends: local filesystem and S3-compatible object
//! storage (AWS S3, MinIO, R2).

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Storage error types
#[derive(Debug)]
pub enum StorageError {
    /// Object not found
    NotFound(String),
    /// IO error
    Io(std::io::Error),
    /// Other error
    Other(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(key) => write!(f, "Object not found: {}", key),
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Other(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(e.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object store trait for pluggable backends.
///
/// Keys are content digests, so a `put` under an existing key always carries
/// identical bytes; re-uploading is logically idempotent and must never
/// corrupt concurrent readers. A failed or aborted `put` must leave no
/// partially-written object visible to `get` (all-or-nothing visibility).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object under its digest key
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()>;

    /// Fetch an object; `NotFound` when the key is absent
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Delete an object (no error if already absent)
    async fn delete(&self, key: &str) -> StorageResult<()>;
}
