//! HashIndex: cached content fingerprints per local path.
//!
//! A cache entry is keyed by the file's `(mtime, size)` at hashing time.
//! Any change to either forces a re-read, so a stale digest is never served.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::fs::{FileStat, FileSystem, FsError};
use crate::types::Fingerprint;

#[derive(Debug, Error)]
pub enum HashIndexError {
    /// File vanished or could not be read between notice and hashing
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: FsError,
    },
}

pub type Result<T> = std::result::Result<T, HashIndexError>;

#[derive(Debug, Clone)]
struct CacheEntry {
    mtime_millis: u64,
    size: u64,
    fingerprint: Fingerprint,
}

pub struct HashIndex<F: FileSystem> {
    fs: F,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl<F: FileSystem> HashIndex<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Fingerprint of the current content of `path`.
    pub async fn fingerprint_of(&self, path: &str) -> Result<Fingerprint> {
        self.observe(path).await.map(|(_, fp)| fp)
    }

    /// Stat and fingerprint `path`, reusing the cached digest when the file's
    /// mtime and size are unchanged.
    pub async fn observe(&self, path: &str) -> Result<(FileStat, Fingerprint)> {
        let stat = self.fs.stat(path).await.map_err(|source| HashIndexError::Read {
            path: path.to_string(),
            source,
        })?;
        if stat.is_dir {
            return Err(HashIndexError::Read {
                path: path.to_string(),
                source: FsError::IsDirectory(path.to_string()),
            });
        }

        if let Some(fp) = self.cached(path, &stat) {
            trace!(path, "fingerprint cache hit");
            return Ok((stat, fp));
        }

        let content = self.fs.read(path).await.map_err(|source| {
            self.invalidate(path);
            HashIndexError::Read {
                path: path.to_string(),
                source,
            }
        })?;
        let fingerprint = Fingerprint::of(&content);

        // Size from the bytes actually hashed; a write racing the stat
        // leaves an entry that will not match the next stat.
        let stat = FileStat {
            size: content.len() as u64,
            ..stat
        };
        self.prime(path, &stat, fingerprint.clone());
        Ok((stat, fingerprint))
    }

    /// Record a fingerprint computed elsewhere (e.g. after writing a download).
    pub fn prime(&self, path: &str, stat: &FileStat, fingerprint: Fingerprint) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            path.to_string(),
            CacheEntry {
                mtime_millis: stat.mtime_millis,
                size: stat.size,
                fingerprint,
            },
        );
    }

    pub fn invalidate(&self, path: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(path);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    fn cached(&self, path: &str, stat: &FileStat) -> Option<Fingerprint> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(path)
            .filter(|e| e.mtime_millis == stat.mtime_millis && e.size == stat.size)
            .map(|e| e.fingerprint.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cache_hit_skips_read() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write_at("a.txt", b"hello", 100).await;
        let index = HashIndex::new(Arc::clone(&fs));

        let first = index.fingerprint_of("a.txt").await.unwrap();
        let reads_after_first = fs.read_count();
        let second = index.fingerprint_of("a.txt").await.unwrap();

        assert_eq!(first, Fingerprint::of(b"hello"));
        assert_eq!(first, second);
        assert_eq!(fs.read_count(), reads_after_first, "second lookup must not rehash");
    }

    #[tokio::test]
    async fn test_mtime_change_forces_rehash() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write_at("a.txt", b"hello", 100).await;
        let index = HashIndex::new(Arc::clone(&fs));
        index.fingerprint_of("a.txt").await.unwrap();

        // Same size, new content, new mtime
        fs.write_at("a.txt", b"HELLO", 200).await;
        let fp = index.fingerprint_of("a.txt").await.unwrap();
        assert_eq!(fp, Fingerprint::of(b"HELLO"));
    }

    #[tokio::test]
    async fn test_size_change_forces_rehash() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write_at("a.txt", b"hello", 100).await;
        let index = HashIndex::new(Arc::clone(&fs));
        index.fingerprint_of("a.txt").await.unwrap();

        // Same mtime, different size
        fs.write_at("a.txt", b"hello world", 100).await;
        let fp = index.fingerprint_of("a.txt").await.unwrap();
        assert_eq!(fp, Fingerprint::of(b"hello world"));
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let index = HashIndex::new(InMemoryFs::new());
        let err = index.fingerprint_of("gone.txt").await.unwrap_err();
        assert!(matches!(err, HashIndexError::Read { ref path, .. } if path == "gone.txt"));
    }

    #[tokio::test]
    async fn test_prime_and_invalidate() {
        let fs = Arc::new(InMemoryFs::new());
        fs.write_at("a.txt", b"data", 7).await;
        let index = HashIndex::new(Arc::clone(&fs));

        let stat = fs.stat("a.txt").await.unwrap();
        index.prime("a.txt", &stat, Fingerprint::of(b"data"));
        assert_eq!(index.len(), 1);

        index.fingerprint_of("a.txt").await.unwrap();
        assert_eq!(fs.read_count(), 0, "primed entry should be served from cache");

        index.invalidate("a.txt");
        assert!(index.is_empty());
    }
}
