//! RemoteStore implementation talking to sync-server over HTTP.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use std::time::Duration;
use sync_core::remote::{
    Download, FileList, MODIFIED_AT_HEADER, RemoteEntry, RemoteError, RemoteStore, Result,
};
use tracing::trace;

/// HTTP client for the sync-server API.
pub struct HttpRemoteStore {
    client: Client,
    base: Url,
}

impl HttpRemoteStore {
    /// Create a client for the server at `base` (e.g. `http://127.0.0.1:8080`).
    ///
    /// `timeout` bounds each request; the retry layer above adds its own
    /// per-attempt bound.
    pub fn new(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Server URL cannot be used as a base: {}", base);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    /// `<base>/<route>/<path segments>`, each segment percent-encoded.
    fn url(&self, route: &str, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Transfer(format!("invalid base URL {}", self.base)))?;
            segments.pop_if_empty().push(route);
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| transfer_error(path, e))?;
        let status = response.status();
        trace!(path, %status, "Remote response");
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        response.error_for_status().map_err(|e| transfer_error(path, e))
    }
}

fn transfer_error(path: &str, e: reqwest::Error) -> RemoteError {
    RemoteError::Transfer(format!("{path}: {e}"))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        let url = self.url("files", "")?;
        let response = self.send(self.client.get(url), "").await?;
        let list: FileList = response
            .json()
            .await
            .map_err(|e| transfer_error("listing", e))?;
        Ok(list.files)
    }

    async fn entry(&self, path: &str) -> Result<Option<RemoteEntry>> {
        let url = self.url("file_info", path)?;
        match self.send(self.client.get(url), path).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| transfer_error(path, e)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn upload(&self, path: &str, content: &[u8], modified_at: Option<u64>) -> Result<()> {
        let url = self.url("upload", path)?;
        let mut request = self.client.put(url).body(content.to_vec());
        if let Some(ts) = modified_at {
            request = request.header(MODIFIED_AT_HEADER, ts.to_string());
        }
        self.send(request, path).await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Download> {
        let url = self.url("download", path)?;
        let response = self.send(self.client.get(url), path).await?;
        let modified_at = response
            .headers()
            .get(MODIFIED_AT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let content = response
            .bytes()
            .await
            .map_err(|e| transfer_error(path, e))?;
        Ok(Download {
            content: content.to_vec(),
            modified_at,
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url("delete", path)?;
        match self.send(self.client.delete(url), path).await {
            Ok(_) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
