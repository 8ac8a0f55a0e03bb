//! HTTP handlers. Each path-taking route validates the path before it
//! touches the store.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use sync_core::ignore::SYNC_DIR;
use sync_core::remote::{FileList, MODIFIED_AT_HEADER, RemoteEntry};

use crate::AppState;
use crate::error::ApiError;

/// GET /files
pub async fn list(State(state): State<Arc<AppState>>) -> Json<FileList> {
    let files = state.store.list().await;
    tracing::debug!(count = files.len(), "Serving file list");
    Json(FileList { files })
}

/// GET /file_info/{*path}
pub async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Json<RemoteEntry>, ApiError> {
    let path = validate_path(&path)?;
    state
        .store
        .entry(path)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(path.to_string()))
}

/// GET /download/{*path}
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let path = validate_path(&path)?;
    let (content, modified_at) = state.store.download(path).await?;
    tracing::debug!(path, size = content.len(), "Serving download");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(MODIFIED_AT_HEADER, HeaderValue::from(modified_at));
    Ok((headers, content).into_response())
}

/// PUT /upload/{*path}
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RemoteEntry>, ApiError> {
    let path = validate_path(&path)?;
    let modified_at = parse_modified_at(&headers)?;
    let entry = state.store.upload(path, &body, modified_at).await?;
    tracing::info!(path, size = entry.size, "Stored upload");
    Ok(Json(entry))
}

/// DELETE /delete/{*path}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<(), ApiError> {
    let path = validate_path(&path)?;
    state.store.delete(path).await?;
    tracing::info!(path, "Deleted");
    Ok(())
}

fn parse_modified_at(headers: &HeaderMap) -> Result<Option<u64>, ApiError> {
    let Some(value) = headers.get(MODIFIED_AT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ApiError::InvalidTimestamp {
            header: MODIFIED_AT_HEADER,
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
}

/// Accept only relative `/`-separated paths that stay inside the served
/// folder and outside its state directory.
pub fn validate_path(path: &str) -> Result<&str, ApiError> {
    let invalid = || ApiError::InvalidPath(path.to_string());

    if path.is_empty() || path.starts_with('/') || path.contains('\\') || path.contains('\0') {
        return Err(invalid());
    }
    for component in path.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(invalid());
        }
    }
    if path.split('/').next() == Some(SYNC_DIR) {
        return Err(invalid());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert_eq!(validate_path("a.txt").unwrap(), "a.txt");
        assert_eq!(validate_path("notes/deep/b.md").unwrap(), "notes/deep/b.md");

        for bad in ["", "/etc/passwd", "../x", "a/../b", "a//b", "a/./b", "a/", "a\\b", ".sync/index.json"] {
            assert!(matches!(validate_path(bad), Err(ApiError::InvalidPath(_))), "{bad:?}");
        }
    }

    #[test]
    fn test_parse_modified_at() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_modified_at(&headers).unwrap(), None);

        headers.insert(MODIFIED_AT_HEADER, HeaderValue::from_static("1700000000000"));
        assert_eq!(parse_modified_at(&headers).unwrap(), Some(1_700_000_000_000));

        headers.insert(MODIFIED_AT_HEADER, HeaderValue::from_static("yesterday"));
        assert!(matches!(
            parse_modified_at(&headers),
            Err(ApiError::InvalidTimestamp { .. })
        ));
    }
}
