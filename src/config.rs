//! Service configuration from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::ingest::{DEFAULT_MAX_UPLOAD_SIZE, DEFAULT_UPLOAD_TIMEOUT};
use crate::storage::StorageConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Admission size cap in bytes
    pub max_upload_size: usize,
    /// Bound on the object upload and queue publish stages
    pub upload_timeout: Duration,
    pub db_path: PathBuf,
    pub storage: StorageConfig,
    pub nats_url: String,
    pub admin_username: String,
    pub admin_password: String,
}

impl Config {
    /// Build configuration from `SAMPLE_VAULT_*` environment variables,
    /// falling back to development defaults.
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("SAMPLE_VAULT_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

        let max_upload_size = std::env::var("SAMPLE_VAULT_MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_SIZE);

        let upload_timeout = std::env::var("SAMPLE_VAULT_UPLOAD_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UPLOAD_TIMEOUT);

        let storage_path = std::env::var("SAMPLE_VAULT_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("sample-vault"));

        let db_path = std::env::var("SAMPLE_VAULT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| storage_path.join("sample-vault.db"));

        // S3 when a bucket is configured, local filesystem otherwise.
        let storage = match std::env::var("SAMPLE_VAULT_S3_BUCKET") {
            Ok(bucket) => match std::env::var("SAMPLE_VAULT_S3_ENDPOINT") {
                Ok(endpoint) => StorageConfig::minio(bucket, endpoint),
                Err(_) => {
                    let region = std::env::var("SAMPLE_VAULT_S3_REGION")
                        .unwrap_or_else(|_| "us-east-1".to_string());
                    StorageConfig::s3(bucket, region)
                }
            },
            Err(_) => StorageConfig::local(storage_path.join("objects")),
        };

        let nats_url = std::env::var("SAMPLE_VAULT_NATS_URL")
            .unwrap_or_else(|_| "nats://127.0.0.1:4222".to_string());

        let admin_username =
            std::env::var("SAMPLE_VAULT_ADMIN_USER").unwrap_or_else(|_| "admin".to_string());
        let admin_password =
            std::env::var("SAMPLE_VAULT_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());

        Self {
            bind_addr,
            max_upload_size,
            upload_timeout,
            db_path,
            storage,
            nats_url,
            admin_username,
            admin_password,
        }
    }
}
