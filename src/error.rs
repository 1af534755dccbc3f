use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("dispatch failure: {0}")]
    Dispatch(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("field not allowed in projection: {0}")]
    InvalidFilter(String),

    #[error("invalid update payload: {0}")]
    Validation(String),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("a flush is already in progress")]
    FlushInProgress,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidFilter(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::AuthRequired => StatusCode::UNAUTHORIZED,
            AppError::AuthFailed => StatusCode::FORBIDDEN,
            AppError::FlushInProgress => StatusCode::CONFLICT,
        }
    }

    /// Short, stable label used as the `message` field of error responses.
    pub fn label(&self) -> &'static str {
        match self {
            AppError::PayloadTooLarge { .. } => "File too large",
            AppError::Storage(_) => "Storage failed",
            AppError::Dispatch(_) => "Publish failed",
            AppError::NotFound(_) => "Not found",
            AppError::InvalidFilter(_) => "Filters not allowed",
            AppError::Validation(_) => "Validation failed",
            AppError::AuthRequired => "Authentication required",
            AppError::AuthFailed => "Authentication failed",
            AppError::FlushInProgress => "Flush in progress",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "message": self.label(),
            "description": self.to_string(),
        }));

        if matches!(self, AppError::AuthRequired) {
            return (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"Sample Vault\"")],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(e: sea_orm::DbErr) -> Self {
        AppError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
