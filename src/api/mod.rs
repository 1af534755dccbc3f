pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

pub use handlers::{
    download_file, flush_files, flush_status, get_file, health, list_files, update_file,
    upload_file, ApiResponse, AppState,
};

/// Build the service router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/files", post(upload_file))
        .route("/v1/files", get(list_files))
        .route("/v1/files", delete(flush_files))
        .route("/v1/files/:digest", get(get_file))
        .route("/v1/files/:digest", put(update_file))
        .route("/v1/files/:digest/download", get(download_file))
        .route("/v1/admin/flush", get(flush_status))
        .route("/health", get(health))
}
