//! FileSystem trait abstraction for the local side of the sync.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-daemon) - Uses tokio::fs
//!
//! All paths are relative to the synced root and `/`-separated.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

use crate::ignore::IgnoreRules;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;
}

/// Recursively collect every non-ignored file below the root.
///
/// Returned paths are sorted so scans are deterministic.
pub async fn walk_files<F: FileSystem + ?Sized>(fs: &F, ignore: &IgnoreRules) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![String::new()];

    while let Some(dir) = pending.pop() {
        for entry in fs.list(&dir).await? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };
            if ignore.is_ignored(&path) {
                continue;
            }
            if entry.is_dir {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<HashMap<String, u64>>,
    /// Number of `read` calls, to assert on cache hits
    reads: RwLock<usize>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            mtimes: RwLock::new(HashMap::new()),
            reads: RwLock::new(0),
        }
    }

    /// Set a specific mtime for testing "latest wins" scenarios
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        let mut mtimes = self.mtimes.write().unwrap();
        mtimes.insert(path, mtime);
    }

    /// Write a file and pin its mtime in one step.
    pub async fn write_at(&self, path: &str, content: &[u8], mtime: u64) {
        self.write(path, content).await.unwrap();
        self.set_mtime(path, mtime);
    }

    /// Remove a file without going through the trait (simulates a user delete).
    pub fn remove(&self, path: &str) {
        let path = Self::normalize_path(path);
        self.files.write().unwrap().remove(&path);
        self.mtimes.write().unwrap().remove(&path);
    }

    /// Raw content, for assertions
    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        let path = Self::normalize_path(path);
        self.files.read().unwrap().get(&path).cloned()
    }

    /// How many times file contents were read
    pub fn read_count(&self) -> usize {
        *self.reads.read().unwrap()
    }

    /// Get current time in milliseconds
    fn current_time_ms() -> u64 {
        crate::types::now_millis()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        *self.reads.write().unwrap() += 1;
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);

        let mut files = self.files.write().unwrap();
        files.insert(path.clone(), content.to_vec());
        drop(files);

        // Update mtime
        let mut mtimes = self.mtimes.write().unwrap();
        mtimes.insert(path, Self::current_time_ms());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let files = self.files.read().unwrap();
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for file_path in files.keys() {
            let Some(rest) = file_path.strip_prefix(&prefix) else {
                continue;
            };
            // Directories are implied by the files below them
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if seen.insert(dir.to_string()) {
                        entries.push(FileEntry {
                            name: dir.to_string(),
                            is_dir: true,
                        });
                    }
                }
                None => {
                    if seen.insert(rest.to_string()) {
                        entries.push(FileEntry {
                            name: rest.to_string(),
                            is_dir: false,
                        });
                    }
                }
            }
        }

        if entries.is_empty() && !path.is_empty() {
            return Err(FsError::NotFound(path));
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap();
        if files.remove(&path).is_some() {
            self.mtimes.write().unwrap().remove(&path);
            return Ok(());
        }
        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        Ok(files.contains_key(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        let files = self.files.read().unwrap();
        let Some(content) = files.get(&path) else {
            return Err(FsError::NotFound(path));
        };
        let mtimes = self.mtimes.read().unwrap();
        let mtime = mtimes.get(&path).copied().unwrap_or(0);
        Ok(FileStat {
            mtime_millis: mtime,
            size: content.len() as u64,
            is_dir: false,
        })
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing a filesystem between the engine and tests
#[async_trait]
impl<T: FileSystem + Send + Sync> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }
}
