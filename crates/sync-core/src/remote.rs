//! RemoteStore trait abstraction for the server side of the sync.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing
//! - `HttpRemoteStore` (in sync-daemon) - Talks to sync-server over HTTP
//!
//! The wire types (`RemoteEntry`, `FileList`) are shared with sync-server.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;

use crate::types::{FileRecord, Fingerprint, now_millis};

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Not found on remote: {0}")]
    NotFound(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Remote call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl RemoteError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RemoteError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// HTTP header carrying a content timestamp (ms since epoch)
pub const MODIFIED_AT_HEADER: &str = "x-modified-at";

/// One entry of the remote inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    /// Content digest (None for tombstones)
    pub fingerprint: Option<Fingerprint>,
    /// Content or deletion time in ms since epoch, on the remote's clock
    pub modified_at: Option<u64>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub tombstone: bool,
}

impl RemoteEntry {
    pub fn to_record(&self) -> FileRecord {
        match (&self.fingerprint, self.tombstone) {
            (Some(fp), false) => {
                FileRecord::live(self.path.clone(), fp.clone(), self.modified_at, self.size)
            }
            _ => FileRecord::tombstone(self.path.clone(), self.modified_at),
        }
    }
}

/// Body of `GET /files`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<RemoteEntry>,
}

/// Downloaded content plus the remote's timestamp for it.
#[derive(Debug, Clone)]
pub struct Download {
    pub content: Vec<u8>,
    pub modified_at: Option<u64>,
}

/// Abstraction over the server's listing/upload/download/delete API.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Full remote inventory, tombstones included.
    async fn list(&self) -> Result<Vec<RemoteEntry>>;

    /// Inventory entry for one path (None if the remote never heard of it).
    async fn entry(&self, path: &str) -> Result<Option<RemoteEntry>> {
        Ok(self.list().await?.into_iter().find(|e| e.path == path))
    }

    /// Store `content` at `path`. Uploading identical content again only
    /// refreshes the timestamp.
    async fn upload(&self, path: &str, content: &[u8], modified_at: Option<u64>) -> Result<()>;

    async fn download(&self, path: &str) -> Result<Download>;

    /// Delete `path`. Deleting an absent path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteStore + Send + Sync> RemoteStore for std::sync::Arc<T> {
    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        (**self).list().await
    }

    async fn entry(&self, path: &str) -> Result<Option<RemoteEntry>> {
        (**self).entry(path).await
    }

    async fn upload(&self, path: &str, content: &[u8], modified_at: Option<u64>) -> Result<()> {
        (**self).upload(path, content, modified_at).await
    }

    async fn download(&self, path: &str) -> Result<Download> {
        (**self).download(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }
}

#[derive(Debug, Clone)]
struct StoredFile {
    content: Option<Vec<u8>>,
    modified_at: u64,
}

/// In-memory remote for testing
///
/// Tracks tombstones like the real server and can be told to fail the next
/// N calls to simulate transient transfer errors.
#[derive(Default)]
pub struct InMemoryRemote {
    files: RwLock<HashMap<String, StoredFile>>,
    failures_left: AtomicUsize,
    upload_failures_left: AtomicUsize,
    /// Report no modification times, like a store that keeps none
    untimed: AtomicBool,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put content directly on the remote (simulates another client's edit).
    pub fn put(&self, path: &str, content: &[u8], modified_at: u64) {
        self.files.write().unwrap_or_else(|e| e.into_inner()).insert(
            path.to_string(),
            StoredFile {
                content: Some(content.to_vec()),
                modified_at,
            },
        );
    }

    /// Tombstone a path directly on the remote.
    pub fn remove(&self, path: &str, deleted_at: u64) {
        self.files.write().unwrap_or_else(|e| e.into_inner()).insert(
            path.to_string(),
            StoredFile {
                content: None,
                modified_at: deleted_at,
            },
        );
    }

    /// Forget a path entirely, tombstone included.
    pub fn forget(&self, path: &str) {
        self.files.write().unwrap_or_else(|e| e.into_inner()).remove(path);
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().unwrap_or_else(|e| e.into_inner()).get(path).and_then(|f| f.content.clone())
    }

    pub fn modified_at(&self, path: &str) -> Option<u64> {
        self.files.read().unwrap_or_else(|e| e.into_inner()).get(path).map(|f| f.modified_at)
    }

    /// Make the next `count` calls fail with a transfer error.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` uploads fail; other calls are unaffected.
    pub fn fail_uploads(&self, count: usize) {
        self.upload_failures_left.store(count, Ordering::SeqCst);
    }

    /// Stop reporting modification times in entries and downloads.
    pub fn omit_timestamps(&self) {
        self.untimed.store(true, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Total transfers of any kind
    pub fn transfer_count(&self) -> usize {
        self.upload_count() + self.download_count() + self.delete_count()
    }

    fn maybe_fail(&self) -> Result<()> {
        Self::take_failure(&self.failures_left)
    }

    fn take_failure(counter: &AtomicUsize) -> Result<()> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(RemoteError::Transfer("injected failure".into()))
        } else {
            Ok(())
        }
    }

    fn timestamp(&self, file: &StoredFile) -> Option<u64> {
        (!self.untimed.load(Ordering::SeqCst)).then_some(file.modified_at)
    }

    fn to_entry(&self, path: &str, file: &StoredFile) -> RemoteEntry {
        match &file.content {
            Some(content) => RemoteEntry {
                path: path.to_string(),
                fingerprint: Some(Fingerprint::of(content)),
                modified_at: self.timestamp(file),
                size: content.len() as u64,
                tombstone: false,
            },
            None => RemoteEntry {
                path: path.to_string(),
                fingerprint: None,
                modified_at: self.timestamp(file),
                size: 0,
                tombstone: true,
            },
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list(&self) -> Result<Vec<RemoteEntry>> {
        self.maybe_fail()?;
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = files.iter().map(|(p, f)| self.to_entry(p, f)).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn entry(&self, path: &str) -> Result<Option<RemoteEntry>> {
        self.maybe_fail()?;
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.get(path).map(|f| self.to_entry(path, f)))
    }

    async fn upload(&self, path: &str, content: &[u8], modified_at: Option<u64>) -> Result<()> {
        self.maybe_fail()?;
        Self::take_failure(&self.upload_failures_left)?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.put(path, content, modified_at.unwrap_or_else(now_millis));
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Download> {
        self.maybe_fail()?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let file = files
            .get(path)
            .filter(|f| f.content.is_some())
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        Ok(Download {
            content: file.content.clone().unwrap_or_default(),
            modified_at: self.timestamp(file),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.maybe_fail()?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let already_gone = files.get(path).is_none_or(|f| f.content.is_none());
        if !already_gone {
            files.insert(
                path.to_string(),
                StoredFile {
                    content: None,
                    modified_at: now_millis(),
                },
            );
        }
        Ok(())
    }
}
