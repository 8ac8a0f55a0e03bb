use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid {header} header: {value}")]
    InvalidTimestamp { header: &'static str, value: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(StorageError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(path) => ApiError::NotFound(path),
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidPath(_) | ApiError::InvalidTimestamp { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Storage(e) => {
                tracing::error!("Storage failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
