//! S3-compatible object store.
//!
//! Compatible with AWS S3, MinIO and R2. Keys are sample digests, optionally
//! under a configurable prefix.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Builder, Credentials, Region},
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;

use super::backend::{ObjectStore, StorageError, StorageResult};

/// S3 object store configuration
#[derive(Clone, Debug)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Optional prefix for all keys (e.g., "samples/")
    pub prefix: Option<String>,
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    pub endpoint: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(bucket: String, region: String) -> Self {
        Self {
            bucket,
            prefix: None,
            region,
            endpoint: None,
            force_path_style: false,
        }
    }

    /// Create config for MinIO or other S3-compatible storage
    pub fn minio(bucket: String, endpoint: String) -> Self {
        Self {
            bucket,
            prefix: None,
            region: "us-east-1".to_string(), // MinIO doesn't care about region
            endpoint: Some(endpoint),
            force_path_style: true,
        }
    }

    /// Set a key prefix
    pub fn with_prefix(mut self, prefix: String) -> Self {
        self.prefix = Some(prefix);
        self
    }
}

/// S3-compatible object store
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Store {
    /// Create a new S3 store from config, with credentials from the environment
    pub async fn new(config: S3Config) -> Self {
        let mut builder = Builder::new()
            .region(Region::new(config.region))
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let sdk_config =
            aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        if let Some(creds) = sdk_config.credentials_provider() {
            builder = builder.credentials_provider(creds);
        }

        let client = Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        }
    }

    /// Create an S3 store with explicit credentials (for testing)
    pub fn with_credentials(config: S3Config, access_key: &str, secret_key: &str) -> Self {
        let creds = Credentials::new(access_key, secret_key, None, None, "static");

        let mut builder = Builder::new()
            .region(Region::new(config.region))
            .force_path_style(config.force_path_style)
            .credentials_provider(creds);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, key),
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StorageResult<()> {
        let s3_key = self.full_key(key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let s3_key = self.full_key(key);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") || e.to_string().contains("404") {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Other(e.to_string())
                }
            })?;

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(data.into_bytes())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let s3_key = self.full_key(key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("404")
                    || err_str.contains("NoSuchKey")
                    || err_str.contains("NotFound")
                {
                    Ok(false)
                } else {
                    Err(StorageError::Other(err_str))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let s3_key = self.full_key(key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&s3_key)
            .send()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(())
    }
}
