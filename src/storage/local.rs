//! Local filesystem object store.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::backend::{ObjectStore, StorageError, StorageResult};

/// Local filesystem object store.
///
/// Objects live in a sharded directory structure:
/// ```text
/// {base_path}/
///   {key[0..2]}/     # First 2 chars of key for sharding
///     {key[2..]}     # Rest of key as filename
/// ```
///
/// Writes go to a temp file in the target shard and are renamed into place,
/// so an interrupted upload never leaves a readable partial object.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Get the full path for a key
    fn key_path(&self, key: &str) -> PathBuf {
        if key.len() >= 2 {
            // Shard by first 2 characters for better filesystem performance
            self.base_path.join(&key[..2]).join(&key[2..])
        } else {
            self.base_path.join(key)
        }
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StorageResult<()> {
        let path = self.key_path(key);
        self.ensure_parent(&path).await?;

        // Write-then-rename in the same directory keeps the rename atomic;
        // readers only ever see a complete object.
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&data)?;
            tmp.flush()?;
            tmp.persist(&path)
                .map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Other(format!("storage write task failed: {}", e)))?
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key);
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key);
        Ok(path.exists())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // Already deleted
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
