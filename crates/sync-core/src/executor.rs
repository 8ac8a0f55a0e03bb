//! ActionExecutor: carries out a decided action and commits the result.
//!
//! The executor is the only writer of `MetadataStore`. A commit happens
//! only after the transfer succeeded, so a failed or interrupted action
//! leaves the previous state in place and the path is simply decided
//! again later.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::fs::{FileSystem, FsError};
use crate::hash_index::HashIndex;
use crate::metadata::{MetadataError, MetadataStore, PathGuard};
use crate::remote::{RemoteError, RemoteStore};
use crate::retry::{RetryConfig, RetryExhausted, with_retry};
use crate::types::{
    Action, Decision, FileRecord, Fingerprint, SyncState, SyncStatus, live_content, now_millis,
};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{action} of {path} failed after {attempts} attempts: {source}")]
    Transfer {
        path: String,
        action: Action,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// The local file changed between decision and execution
    #[error("Local copy of {path} changed since the decision was made")]
    Stale { path: String },

    #[error("Filesystem error on {path}: {source}")]
    Fs {
        path: String,
        #[source]
        source: FsError,
    },

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl ExecError {
    fn transfer(path: &str, action: Action, exhausted: RetryExhausted) -> Self {
        ExecError::Transfer {
            path: path.to_string(),
            action,
            attempts: exhausted.attempts,
            source: exhausted.last_error,
        }
    }

    fn fs(path: &str, source: FsError) -> Self {
        ExecError::Fs {
            path: path.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// What the executor did for one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub action: Action,
    /// State written to the store (None when nothing was committed)
    pub committed: Option<SyncState>,
    /// The path's metadata was dropped (both sides deleted)
    pub purged: bool,
}

impl Applied {
    fn committed(action: Action, state: SyncState) -> Self {
        Self {
            action,
            committed: Some(state),
            purged: false,
        }
    }
}

pub struct ActionExecutor<F: FileSystem, R: RemoteStore> {
    hashes: Arc<HashIndex<F>>,
    metadata: Arc<MetadataStore>,
    remote: Arc<R>,
    retry: RetryConfig,
}

impl<F: FileSystem, R: RemoteStore> ActionExecutor<F, R> {
    pub fn new(
        hashes: Arc<HashIndex<F>>,
        metadata: Arc<MetadataStore>,
        remote: Arc<R>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            hashes,
            metadata,
            remote,
            retry,
        }
    }

    /// Apply `decision` while holding the path's lock.
    pub async fn apply(&self, guard: &PathGuard, decision: &Decision) -> Result<Applied> {
        let path = guard.path();
        debug_assert_eq!(path, decision.path);

        match decision.action {
            Action::Upload => self.upload(path, decision).await,
            Action::Download => self.download(path, decision).await,
            Action::DeleteLocal => self.delete_local(path, decision).await,
            Action::DeleteRemote => self.delete_remote(path, decision).await,
            Action::None => self.settle(path, decision),
        }
    }

    async fn upload(&self, path: &str, decision: &Decision) -> Result<Applied> {
        let content = match self.hashes.fs().read(path).await {
            Ok(content) => content,
            Err(FsError::NotFound(_)) => {
                return Err(ExecError::Stale {
                    path: path.to_string(),
                });
            }
            Err(e) => return Err(ExecError::fs(path, e)),
        };

        // Commit what was actually sent, even if the file moved on since
        let fingerprint = Fingerprint::of(&content);
        let modified_at = match &decision.local {
            Some(local) if local.content() == Some(&fingerprint) => local.modified_at,
            _ => self
                .hashes
                .fs()
                .stat(path)
                .await
                .map(|s| s.mtime_millis)
                .ok()
                .or(Some(now_millis())),
        };

        with_retry("upload", &self.retry, || {
            self.remote.upload(path, &content, modified_at)
        })
        .await
        .map_err(|e| ExecError::transfer(path, Action::Upload, e))?;

        info!(path, %fingerprint, "Uploaded");
        let record = FileRecord::live(path, fingerprint, modified_at, content.len() as u64);
        self.commit(Action::Upload, SyncState::new(path, Some(record.clone()), Some(record)))
    }

    async fn download(&self, path: &str, decision: &Decision) -> Result<Applied> {
        self.ensure_local_unchanged(path, decision).await?;

        let download = with_retry("download", &self.retry, || self.remote.download(path))
            .await
            .map_err(|e| ExecError::transfer(path, Action::Download, e))?;

        let fingerprint = Fingerprint::of(&download.content);
        let expected = live_content(decision.remote.as_ref());
        if expected != Some(&fingerprint) {
            debug!(path, "Remote content moved on since listing, keeping what was downloaded");
        }

        let fs = self.hashes.fs();
        fs.write(path, &download.content)
            .await
            .map_err(|e| ExecError::fs(path, e))?;
        let stat = fs.stat(path).await.map_err(|e| ExecError::fs(path, e))?;
        self.hashes.prime(path, &stat, fingerprint.clone());

        let size = download.content.len() as u64;
        let local = FileRecord::live(path, fingerprint.clone(), Some(stat.mtime_millis), size);
        let remote = FileRecord::live(path, fingerprint, download.modified_at, size);
        info!(path, size, "Downloaded");
        self.commit(Action::Download, SyncState::new(path, Some(local), Some(remote)))
    }

    async fn delete_local(&self, path: &str, decision: &Decision) -> Result<Applied> {
        self.ensure_local_unchanged(path, decision).await?;

        match self.hashes.fs().delete(path).await {
            Ok(()) | Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(ExecError::fs(path, e)),
        }
        self.hashes.invalidate(path);

        let deleted_at = decision.remote.as_ref().and_then(|r| r.modified_at);
        info!(path, "Deleted local copy");
        self.commit(Action::DeleteLocal, Self::tombstoned(path, deleted_at))
    }

    async fn delete_remote(&self, path: &str, decision: &Decision) -> Result<Applied> {
        with_retry("delete", &self.retry, || self.remote.delete(path))
            .await
            .map_err(|e| ExecError::transfer(path, Action::DeleteRemote, e))?;

        let deleted_at = decision.local.as_ref().and_then(|r| r.modified_at);
        info!(path, "Deleted remote copy");
        self.commit(Action::DeleteRemote, Self::tombstoned(path, deleted_at))
    }

    fn settle(&self, path: &str, decision: &Decision) -> Result<Applied> {
        if decision.status == SyncStatus::BothDeleted {
            let known = self.metadata.get(path).is_some();
            self.metadata.remove(path)?;
            self.hashes.invalidate(path);
            if known {
                debug!(path, "Purged metadata for path deleted on both sides");
            }
            return Ok(Applied {
                action: Action::None,
                committed: None,
                purged: known,
            });
        }

        match &decision.staged {
            Some(state) => self.commit(Action::None, state.clone()),
            None => Ok(Applied {
                action: Action::None,
                committed: None,
                purged: false,
            }),
        }
    }

    /// Refuse to overwrite or delete local content the decision did not see.
    async fn ensure_local_unchanged(&self, path: &str, decision: &Decision) -> Result<()> {
        let fs = self.hashes.fs();
        let exists = fs.exists(path).await.map_err(|e| ExecError::fs(path, e))?;
        let current = if exists {
            match self.hashes.fingerprint_of(path).await {
                Ok(fp) => Some(fp),
                // Vanished between exists and read
                Err(_) => None,
            }
        } else {
            None
        };

        if current.as_ref() != live_content(decision.local.as_ref()) {
            return Err(ExecError::Stale {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn tombstoned(path: &str, deleted_at: Option<u64>) -> SyncState {
        SyncState::new(
            path,
            Some(FileRecord::tombstone(path, deleted_at)),
            Some(FileRecord::tombstone(path, deleted_at)),
        )
    }

    fn commit(&self, action: Action, state: SyncState) -> Result<Applied> {
        self.metadata.put(state.clone())?;
        Ok(Applied::committed(action, state))
    }
}
