//! Storage configuration.

use std::path::PathBuf;
use std::sync::Arc;

use super::{LocalStore, ObjectStore, S3Config, S3Store};

/// Storage backend type
#[derive(Debug, Clone)]
pub enum StorageType {
    /// Local filesystem storage
    Local { path: PathBuf },
    /// S3-compatible storage (AWS S3, MinIO, R2, etc.)
    S3(S3Config),
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Local {
            path: std::env::temp_dir().join("sample-vault-objects"),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Storage backend type
    pub storage_type: StorageType,
}

impl StorageConfig {
    /// Create config for local storage at the given path
    pub fn local(path: PathBuf) -> Self {
        Self {
            storage_type: StorageType::Local { path },
        }
    }

    /// Create config for AWS S3 storage
    pub fn s3(bucket: String, region: String) -> Self {
        Self {
            storage_type: StorageType::S3(S3Config::aws(bucket, region)),
        }
    }

    /// Create config for MinIO or other S3-compatible storage
    pub fn minio(bucket: String, endpoint: String) -> Self {
        Self {
            storage_type: StorageType::S3(S3Config::minio(bucket, endpoint)),
        }
    }

    /// Build an object store from this config
    pub async fn build(&self) -> Arc<dyn ObjectStore> {
        match &self.storage_type {
            StorageType::Local { path } => {
                std::fs::create_dir_all(path).ok();
                Arc::new(LocalStore::new(path.clone()))
            }
            StorageType::S3(config) => Arc::new(S3Store::new(config.clone()).await),
        }
    }
}
