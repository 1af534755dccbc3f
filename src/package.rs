//! Safe-download packaging.
//!
//! Stored content may be malicious, so it is never served raw: the bytes are
//! wrapped in a password-protected zip before leaving the service. The
//! password is a fixed convention understood by the consuming analyst, not a
//! secret; its only job is to defeat naive double-click or auto-extract
//! behavior on the recipient's machine.

use std::io::{Cursor, Write};
use std::sync::Arc;

use bytes::Bytes;
use zip::unstable::write::FileOptionsExt;

use crate::digest::ContentDigest;
use crate::error::AppError;
use crate::storage::{ObjectStore, StorageError};

/// Convention password shared with analysts.
pub const ARCHIVE_PASSWORD: &[u8] = b"infected";

/// A packaged sample ready to be returned to the caller.
#[derive(Debug, Clone)]
pub struct PackagedSample {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct RetrievalPackager {
    store: Arc<dyn ObjectStore>,
}

impl RetrievalPackager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Fetch the object for `digest` and wrap it in a protective archive.
    /// Unknown digests fail with `NotFound` before any packaging work.
    pub async fn package(&self, digest: &ContentDigest) -> Result<PackagedSample, AppError> {
        let hex = digest.to_hex();

        let data = self.store.get(&hex).await.map_err(|e| match e {
            StorageError::NotFound(_) => AppError::NotFound(hex.clone()),
            other => AppError::Storage(other.to_string()),
        })?;

        // Archive construction is CPU-bound.
        let entry_name = hex.clone();
        let bytes = tokio::task::spawn_blocking(move || build_archive(&entry_name, &data))
            .await
            .map_err(|e| AppError::Storage(format!("packaging task failed: {}", e)))??;

        tracing::debug!(digest = %hex, archive_size = bytes.len(), "sample packaged");
        Ok(PackagedSample {
            filename: format!("{}.zip", hex),
            bytes,
        })
    }
}

fn build_archive(entry_name: &str, data: &Bytes) -> Result<Vec<u8>, AppError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .with_deprecated_encryption(ARCHIVE_PASSWORD);

    writer
        .start_file(entry_name, options)
        .map_err(|e| AppError::Storage(format!("archive packaging failed: {}", e)))?;
    writer
        .write_all(data)
        .map_err(|e| AppError::Storage(format!("archive packaging failed: {}", e)))?;
    let cursor = writer
        .finish()
        .map_err(|e| AppError::Storage(format!("archive packaging failed: {}", e)))?;

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use std::io::Read;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_package_round_trips_with_convention_password() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp_dir.path().to_path_buf()));

        let content = Bytes::from_static(b"MZ\x90\x00 definitely a suspicious sample");
        let digest = ContentDigest::from_data(&content);
        store
            .put(&digest.to_hex(), content.clone(), "application/octet-stream")
            .await
            .unwrap();

        let packager = RetrievalPackager::new(store);
        let packaged = packager.package(&digest).await.unwrap();
        assert_eq!(packaged.filename, format!("{}.zip", digest.to_hex()));

        // Extraction with the convention password reproduces the bytes.
        let mut archive = zip::ZipArchive::new(Cursor::new(packaged.bytes)).unwrap();
        let mut entry = archive
            .by_name_decrypt(&digest.to_hex(), ARCHIVE_PASSWORD)
            .unwrap()
            .expect("convention password must open the archive");
        let mut extracted = Vec::new();
        entry.read_to_end(&mut extracted).unwrap();
        assert_eq!(extracted, content);
    }

    #[tokio::test]
    async fn test_archive_rejects_wrong_password() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp_dir.path().to_path_buf()));

        let content = Bytes::from_static(b"sample bytes");
        let digest = ContentDigest::from_data(&content);
        store
            .put(&digest.to_hex(), content, "application/octet-stream")
            .await
            .unwrap();

        let packager = RetrievalPackager::new(store);
        let packaged = packager.package(&digest).await.unwrap();

        // ZipCrypto's password check is a single byte, so a wrong password is
        // either rejected outright or decrypts to garbage; it must never
        // reproduce the plaintext.
        let mut archive = zip::ZipArchive::new(Cursor::new(packaged.bytes)).unwrap();
        match archive.by_name_decrypt(&digest.to_hex(), b"not-the-password") {
            Ok(Err(_)) => {}
            Ok(Ok(mut entry)) => {
                let mut extracted = Vec::new();
                let _ = entry.read_to_end(&mut extracted);
                assert_ne!(extracted, b"sample bytes".to_vec());
            }
            Err(e) => panic!("unexpected archive error: {}", e),
        };
    }

    #[tokio::test]
    async fn test_unknown_digest_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::new(temp_dir.path().to_path_buf()));
        let packager = RetrievalPackager::new(store);

        let digest = ContentDigest::from_data(b"never admitted");
        let err = packager.package(&digest).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
