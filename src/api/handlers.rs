use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::db::MetadataRepository;
use crate::digest::ContentDigest;
use crate::error::AppError;
use crate::flush::FlushSupervisor;
use crate::ingest::IngestionPipeline;
use crate::package::RetrievalPackager;

/// Application state shared across handlers
pub struct AppState {
    pub pipeline: IngestionPipeline,
    pub packager: RetrievalPackager,
    pub repo: Arc<dyn MetadataRepository>,
    pub flush: FlushSupervisor,
}

/// Response envelope for admission and error responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

fn envelope(
    status: StatusCode,
    digest: Option<String>,
    message: &str,
    description: &str,
    filename: Option<String>,
) -> Response {
    (
        status,
        Json(ApiResponse {
            digest,
            message: message.to_string(),
            description: Some(description.to_string()),
            filename,
        }),
    )
        .into_response()
}

/// A failed multipart read is usually a malformed body, but when the
/// underlying cause is the body size limit the response must still be a
/// 413, matching the admission size policy.
fn multipart_failure(e: MultipartError, filename: Option<String>) -> Response {
    let status = e.status();
    let message = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "File too large"
    } else {
        "Malformed upload"
    };
    envelope(
        status,
        None,
        message,
        &format!("Failed to read upload: {}", e),
        filename,
    )
}

/// Extract Basic-auth credentials from request headers.
fn extract_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// POST /v1/files - Admit a submission
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut filename: Option<String> = None;
    let mut content: Option<bytes::Bytes> = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() == Some("file") {
                    filename = field.file_name().map(str::to_string);
                    match field.bytes().await {
                        Ok(bytes) => {
                            content = Some(bytes);
                            break;
                        }
                        Err(e) => return multipart_failure(e, filename),
                    }
                }
            }
            Ok(None) => break,
            Err(e) => return multipart_failure(e, filename),
        }
    }

    let Some(content) = content else {
        return envelope(
            StatusCode::BAD_REQUEST,
            None,
            "Missing file",
            "Did you send the file via the form request?",
            filename,
        );
    };

    match state.pipeline.admit(content).await {
        Ok(admission) => envelope(
            StatusCode::CREATED,
            Some(admission.digest.to_hex()),
            "ok",
            "File queued successfully for analysis",
            filename,
        ),
        Err(e) => envelope(
            e.source.status_code(),
            e.digest.map(|d| d.to_hex()),
            e.source.label(),
            &e.source.to_string(),
            filename,
        ),
    }
}

/// Query params for listing files
#[derive(Deserialize)]
pub struct ListQuery {
    pub fields: Option<String>,
}

/// GET /v1/files - List records, optionally projecting fields
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let fields: Vec<String> = query
        .fields
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    match state.repo.list_projected(&fields).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => e.into_response(),
    }
}

fn parse_digest(raw: &str) -> Result<ContentDigest, AppError> {
    ContentDigest::from_hex(raw)
        .ok_or_else(|| AppError::Validation(format!("malformed digest: {}", raw)))
}

/// GET /v1/files/:digest - Full record
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Response {
    let digest = match parse_digest(&digest) {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    match state.repo.get(&digest.to_hex()).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => e.into_response(),
    }
}

/// PUT /v1/files/:digest - Merge a partial update into the record
pub async fn update_file(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let digest = match parse_digest(&digest) {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    let Some(patch) = body.as_object() else {
        return AppError::Validation("update payload must be a JSON object".to_string())
            .into_response();
    };

    match state.repo.merge_update(&digest.to_hex(), patch).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /v1/files/:digest/download - Packaged protective archive
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(digest): Path<String>,
) -> Response {
    let digest = match parse_digest(&digest) {
        Ok(d) => d,
        Err(e) => return e.into_response(),
    };

    match state.packager.package(&digest).await {
        Ok(packaged) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/zip".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", packaged.filename),
                ),
            ],
            packaged.bytes,
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /v1/files - Trigger the supervised flush (Basic auth required)
pub async fn flush_files(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some((username, password)) = extract_basic_auth(&headers) else {
        return AppError::AuthRequired.into_response();
    };

    if let Err(e) = state.repo.verify_admin(&username, &password).await {
        return e.into_response();
    }

    match state.flush.trigger(state.repo.clone()) {
        Ok(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /v1/admin/flush - Flush task status
pub async fn flush_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.flush.status()).into_response()
}

/// Health check endpoint
pub async fn health() -> Response {
    let json = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    });
    Json(json).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteRepository;
    use crate::queue::{DispatchError, JobDispatcher};
    use crate::storage::{LocalStore, ObjectStore};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::DefaultBodyLimit;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NullDispatcher;

    #[async_trait]
    impl JobDispatcher for NullDispatcher {
        async fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    /// App with a tiny admission cap and the same body-limit headroom
    /// layering as the real server.
    async fn test_app(max_upload_size: usize, headroom: usize) -> (axum::Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path().join("objects")));
        let repo: Arc<dyn MetadataRepository> = Arc::new(
            SqliteRepository::open(&dir.path().join("test.db"), "admin".into(), "pw".into())
                .await
                .unwrap(),
        );
        let dispatcher: Arc<dyn JobDispatcher> = Arc::new(NullDispatcher);

        let state = Arc::new(AppState {
            pipeline: IngestionPipeline::new(
                store.clone(),
                repo.clone(),
                dispatcher,
                max_upload_size,
                Duration::from_secs(5),
            ),
            packager: RetrievalPackager::new(store),
            repo,
            flush: FlushSupervisor::new(),
        });

        let app = crate::api::router()
            .with_state(state)
            .layer(DefaultBodyLimit::max(max_upload_size + headroom));
        (app, dir)
    }

    fn multipart_upload(content: &[u8]) -> Request<Body> {
        let boundary = "test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"sample.bin\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/v1/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn response_message(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        json["message"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_upload_over_the_cap_is_payload_too_large() {
        let (app, _dir) = test_app(8, 4096).await;

        // Within the body-limit headroom: the admission size check fires.
        let response = app.oneshot(multipart_upload(&[0u8; 64])).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response_message(response).await, "File too large");
    }

    #[tokio::test]
    async fn test_upload_beyond_body_limit_is_payload_too_large() {
        let (app, _dir) = test_app(8, 64).await;

        // Beyond cap + headroom the multipart read itself trips the body
        // limit; the response must still be a 413, not a 400.
        let response = app.oneshot(multipart_upload(&[0u8; 4096])).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(response_message(response).await, "File too large");
    }

    #[tokio::test]
    async fn test_upload_within_the_cap_is_created() {
        let (app, _dir) = test_app(1024, 4096).await;

        let response = app.oneshot(multipart_upload(b"tiny sample")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn test_extract_basic_auth() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {}", BASE64.encode("admin:hunter2"))
                .parse()
                .unwrap(),
        );
        let (user, pass) = extract_basic_auth(&headers).unwrap();
        assert_eq!(user, "admin");
        assert_eq!(pass, "hunter2");
    }

    #[test]
    fn test_extract_basic_auth_missing_or_malformed() {
        assert!(extract_basic_auth(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer token".parse().unwrap());
        assert!(extract_basic_auth(&headers).is_none());
    }
}
