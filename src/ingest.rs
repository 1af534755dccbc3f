//! Admission pipeline: hash, store, record, dispatch.
//!
//! Single entry point for accepting a submission. The stage order is fixed:
//! size check, digest, object upload (bounded by a timeout), metadata record,
//! queue publish. Each stage is idempotent at its boundary, so a failed
//! admission can simply be retried with the same content.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::db::MetadataRepository;
use crate::digest::ContentDigest;
use crate::error::AppError;
use crate::queue::JobDispatcher;
use crate::record::{FileRecord, ScanStatus};
use crate::storage::ObjectStore;

/// Topic the analysis pipeline consumes from.
pub const SCAN_TOPIC: &str = "scan";

pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const SAMPLE_CONTENT_TYPE: &str = "application/octet-stream";

/// Successful admission result.
#[derive(Debug, Clone)]
pub struct Admission {
    pub digest: ContentDigest,
    pub status: ScanStatus,
    /// Whether identical content had been admitted before.
    pub already_known: bool,
}

/// Admission failure, carrying the digest when one was computed so the
/// caller can return a structured response identifying the submission.
#[derive(Debug)]
pub struct AdmitError {
    pub digest: Option<ContentDigest>,
    pub source: AppError,
}

impl AdmitError {
    fn early(source: AppError) -> Self {
        Self {
            digest: None,
            source,
        }
    }

    fn at(digest: ContentDigest, source: AppError) -> Self {
        Self {
            digest: Some(digest),
            source,
        }
    }
}

pub struct IngestionPipeline {
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn MetadataRepository>,
    dispatcher: Arc<dyn JobDispatcher>,
    max_upload_size: usize,
    upload_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        repo: Arc<dyn MetadataRepository>,
        dispatcher: Arc<dyn JobDispatcher>,
        max_upload_size: usize,
        upload_timeout: Duration,
    ) -> Self {
        Self {
            store,
            repo,
            dispatcher,
            max_upload_size,
            upload_timeout,
        }
    }

    /// Admit a submission: returns the content digest and the `Queued`
    /// status on success.
    pub async fn admit(&self, content: Bytes) -> Result<Admission, AdmitError> {
        // Size policy first; an oversize payload must not touch the store
        // or the queue.
        if content.len() > self.max_upload_size {
            return Err(AdmitError::early(AppError::PayloadTooLarge {
                size: content.len(),
                limit: self.max_upload_size,
            }));
        }

        let size = content.len() as i64;
        let digest = ContentDigest::from_data(&content);
        let hex = digest.to_hex();
        tracing::debug!(digest = %hex, size, "admitting submission");

        // Object upload, bounded. A failure or timeout aborts the whole
        // admission: no metadata record may point at a missing blob.
        match tokio::time::timeout(
            self.upload_timeout,
            self.store.put(&hex, content, SAMPLE_CONTENT_TYPE),
        )
        .await
        {
            Err(_) => {
                return Err(AdmitError::at(
                    digest,
                    AppError::Storage(format!(
                        "object upload timed out after {:?}",
                        self.upload_timeout
                    )),
                ));
            }
            Ok(Err(e)) => {
                return Err(AdmitError::at(
                    digest,
                    AppError::Storage(format!("object upload failed: {}", e)),
                ));
            }
            Ok(Ok(())) => {}
        }

        // Metadata record. The blob stays in place on failure; retrying the
        // same content is idempotent at the storage layer.
        let record = FileRecord::new(hex.clone(), size);
        let created = match self.repo.create_if_absent(&record).await {
            Ok(created) => created,
            Err(e) => {
                return Err(AdmitError::at(
                    digest,
                    AppError::Storage(format!("metadata write failed: {}", e)),
                ));
            }
        };
        if !created {
            tracing::debug!(digest = %hex, "content already known, record preserved");
        }

        // Queue publish, bounded like the upload; a wedged broker must not
        // pin the request. On failure the record stays Queued with no job
        // published; that stuck state needs an operator, so log loudly.
        match tokio::time::timeout(
            self.upload_timeout,
            self.dispatcher.publish(SCAN_TOPIC, hex.as_bytes()),
        )
        .await
        {
            Err(_) => {
                tracing::error!(
                    digest = %hex,
                    "dispatch timed out; record left in queued state with no job published"
                );
                return Err(AdmitError::at(
                    digest,
                    AppError::Dispatch(format!(
                        "queue publish timed out after {:?}",
                        self.upload_timeout
                    )),
                ));
            }
            Ok(Err(e)) => {
                tracing::error!(
                    digest = %hex,
                    error = %e,
                    "dispatch failed; record left in queued state with no job published"
                );
                return Err(AdmitError::at(digest, AppError::Dispatch(e.to_string())));
            }
            Ok(Ok(())) => {}
        }

        tracing::info!(digest = %hex, size, "submission admitted and queued for analysis");
        Ok(Admission {
            digest,
            status: ScanStatus::Queued,
            already_known: !created,
        })
    }
}
