//! sync-server: serves one folder over HTTP as the remote side of
//! folder sync.
//!
//! Provides:
//! - File listing with fingerprints, timestamps and tombstones
//! - Per-path info, download, upload and delete
//! - A persistent index in `.sync/index.json`, rebuilt against the folder
//!   at startup

pub mod error;
pub mod routes;
pub mod storage;

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, put},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use storage::{FileStore, StorageError};

/// Largest accepted upload body
pub const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Shared application state
pub struct AppState {
    pub store: FileStore,
}

impl AppState {
    pub fn new(store: FileStore) -> Self {
        Self { store }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/files", get(routes::list))
        .route("/file_info/{*path}", get(routes::file_info))
        .route("/download/{*path}", get(routes::download))
        .route("/upload/{*path}", put(routes::upload))
        .route("/delete/{*path}", delete(routes::delete))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use sync_core::remote::{FileList, MODIFIED_AT_HEADER, RemoteEntry};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> Router {
        let store = FileStore::open(dir.path()).unwrap();
        router(Arc::new(AppState::new(store)))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let response = app
            .clone()
            .oneshot(
                Request::put("/upload/notes/a.txt")
                    .header(MODIFIED_AT_HEADER, "1234")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entry: RemoteEntry = body_json(response).await;
        assert_eq!(entry.path, "notes/a.txt");
        assert_eq!(entry.modified_at, Some(1234));

        let response = app
            .clone()
            .oneshot(Request::get("/download/notes/a.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[MODIFIED_AT_HEADER], "1234");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404_and_bad_path_is_400() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        let response = app
            .clone()
            .oneshot(Request::get("/file_info/missing.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(Request::get("/download/.sync/index.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::put("/upload/x.txt")
                    .header(MODIFIED_AT_HEADER, "soon")
                    .body(Body::from("x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_in_listing() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir);

        app.clone()
            .oneshot(Request::put("/upload/b.txt").body(Body::from("B")).unwrap())
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(Request::delete("/delete/b.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Absent paths delete fine too
        let response = app
            .clone()
            .oneshot(Request::delete("/delete/never.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let list: FileList = body_json(response).await;
        assert_eq!(list.files.len(), 1);
        assert!(list.files[0].tombstone);
        assert!(!dir.path().join("b.txt").exists());
    }
}
