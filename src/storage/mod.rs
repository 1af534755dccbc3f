//! Object store abstraction.
//!
//! Provides a pluggable blob store keyed by content digest, backed by:
//! - Local filesystem (default)
//! - S3-compatible object storage (AWS S3, MinIO, R2, etc.)

mod backend;
mod config;
mod local;
mod s3;

pub use backend::{ObjectStore, StorageError, StorageResult};
pub use config::{StorageConfig, StorageType};
pub use local::LocalStore;
pub use s3::{S3Config, S3Store};
