//! Served folder plus its persistent index of fingerprints, timestamps and
//! tombstones.
//!
//! The index lives in `.sync/index.json` inside the served folder. At startup
//! the folder is rescanned so files edited out of band get a fresh
//! fingerprint and their filesystem mtime as content timestamp.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use sync_core::ignore::SYNC_DIR;
use sync_core::types::now_millis;
use sync_core::{Fingerprint, IgnoreRules, RemoteEntry};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File name of the index within `.sync/`
pub const INDEX_FILE: &str = "index.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt index {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    /// None for tombstones
    fingerprint: Option<Fingerprint>,
    /// Content timestamp (client supplied or server time), or deletion time
    modified_at: u64,
    size: u64,
    tombstone: bool,
    /// Filesystem mtime when last indexed, to spot out-of-band edits
    #[serde(default)]
    fs_mtime: u64,
}

impl IndexEntry {
    fn tombstone(deleted_at: u64) -> Self {
        Self {
            fingerprint: None,
            modified_at: deleted_at,
            size: 0,
            tombstone: true,
            fs_mtime: 0,
        }
    }

    fn is_live(&self) -> bool {
        !self.tombstone && self.fingerprint.is_some()
    }

    fn to_remote(&self, path: &str) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            fingerprint: self.fingerprint.clone(),
            modified_at: Some(self.modified_at),
            size: self.size,
            tombstone: self.tombstone,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    entries: BTreeMap<String, IndexEntry>,
}

/// The served folder.
pub struct FileStore {
    root: PathBuf,
    index_path: PathBuf,
    /// Guards the index and serializes mutations of the folder
    entries: Mutex<BTreeMap<String, IndexEntry>>,
}

impl FileStore {
    /// Open `root`, creating it if needed, and reconcile the index with
    /// what is actually on disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(SYNC_DIR)).map_err(io_err(&root))?;
        let index_path = root.join(SYNC_DIR).join(INDEX_FILE);

        let mut entries = load_index(&index_path)?;
        let changed = rescan(&root, &mut entries)?;
        info!(files = entries.values().filter(|e| e.is_live()).count(), changed, "Index ready");

        write_index(&index_path, &entries)?;
        Ok(Self {
            root,
            index_path,
            entries: Mutex::new(entries),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every indexed path, tombstones included, sorted.
    pub async fn list(&self) -> Vec<RemoteEntry> {
        let entries = self.entries.lock().await;
        entries.iter().map(|(path, e)| e.to_remote(path)).collect()
    }

    pub async fn entry(&self, path: &str) -> Option<RemoteEntry> {
        let entries = self.entries.lock().await;
        entries.get(path).map(|e| e.to_remote(path))
    }

    /// Store `content` at `path`. Identical content only refreshes the
    /// timestamp.
    pub async fn upload(
        &self,
        path: &str,
        content: &[u8],
        modified_at: Option<u64>,
    ) -> Result<RemoteEntry> {
        let mut entries = self.entries.lock().await;
        let full_path = self.root.join(path);
        let fingerprint = Fingerprint::of(content);
        let modified_at = modified_at.unwrap_or_else(now_millis);

        let unchanged = entries
            .get(path)
            .is_some_and(|e| e.is_live() && e.fingerprint.as_ref() == Some(&fingerprint));
        if !unchanged || !tokio::fs::try_exists(&full_path).await.unwrap_or(false) {
            write_atomic(&full_path, content).await?;
        }
        let fs_mtime = tokio::fs::metadata(&full_path)
            .await
            .map(|m| mtime_millis(&m))
            .map_err(io_err(&full_path))?;

        let entry = IndexEntry {
            fingerprint: Some(fingerprint),
            modified_at,
            size: content.len() as u64,
            tombstone: false,
            fs_mtime,
        };
        debug!(path, size = entry.size, unchanged, "Stored upload");
        let remote = entry.to_remote(path);
        entries.insert(path.to_string(), entry);
        self.save(&entries).await?;
        Ok(remote)
    }

    /// Content and timestamp of a live path.
    pub async fn download(&self, path: &str) -> Result<(Vec<u8>, u64)> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(path).filter(|e| e.is_live()) else {
            return Err(StorageError::NotFound(path.to_string()));
        };
        let modified_at = entry.modified_at;

        let full_path = self.root.join(path);
        match tokio::fs::read(&full_path).await {
            Ok(content) => Ok((content, modified_at)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Removed behind our back; record it so listings agree
                entries.insert(path.to_string(), IndexEntry::tombstone(now_millis()));
                self.save(&entries).await?;
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(io_err(&full_path)(e)),
        }
    }

    /// Delete `path` and record a tombstone. Absent paths are fine.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let full_path = self.root.join(path);

        let removed = match tokio::fs::remove_file(&full_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(io_err(&full_path)(e)),
        };
        let was_live = entries.get(path).is_some_and(IndexEntry::is_live);

        if removed || was_live {
            entries.insert(path.to_string(), IndexEntry::tombstone(now_millis()));
            self.save(&entries).await?;
            debug!(path, "Deleted");
        }
        Ok(())
    }

    async fn save(&self, entries: &BTreeMap<String, IndexEntry>) -> Result<()> {
        let persisted = PersistedIndex {
            version: FORMAT_VERSION,
            entries: entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&persisted).map_err(|source| StorageError::Corrupt {
            path: self.index_path.clone(),
            source,
        })?;
        write_atomic(&self.index_path, &json).await
    }
}

fn load_index(index_path: &Path) -> Result<BTreeMap<String, IndexEntry>> {
    let contents = match std::fs::read_to_string(index_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(io_err(index_path)(e)),
    };
    let persisted: PersistedIndex =
        serde_json::from_str(&contents).map_err(|source| StorageError::Corrupt {
            path: index_path.to_path_buf(),
            source,
        })?;
    if persisted.version != FORMAT_VERSION {
        info!(version = persisted.version, "Unknown index version, rebuilding from disk");
        return Ok(BTreeMap::new());
    }
    Ok(persisted.entries)
}

fn write_index(index_path: &Path, entries: &BTreeMap<String, IndexEntry>) -> Result<()> {
    let persisted = PersistedIndex {
        version: FORMAT_VERSION,
        entries: entries.clone(),
    };
    let json = serde_json::to_vec_pretty(&persisted).map_err(|source| StorageError::Corrupt {
        path: index_path.to_path_buf(),
        source,
    })?;
    let tmp = index_path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(io_err(&tmp))?;
    std::fs::rename(&tmp, index_path).map_err(io_err(index_path))
}

/// Bring `entries` in line with the files under `root`. Returns how many
/// entries changed.
fn rescan(root: &Path, entries: &mut BTreeMap<String, IndexEntry>) -> Result<usize> {
    let ignore = IgnoreRules::default();
    let mut seen = HashSet::new();
    let mut changed = 0;
    let mut pending = vec![PathBuf::new()];

    while let Some(dir) = pending.pop() {
        let full_dir = root.join(&dir);
        for item in std::fs::read_dir(&full_dir).map_err(io_err(&full_dir))? {
            let item = item.map_err(io_err(&full_dir))?;
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let relative = dir.join(&name);
            let key = relative
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("/");
            if ignore.is_ignored(&key) {
                continue;
            }

            let file_type = item.file_type().map_err(io_err(&item.path()))?;
            if file_type.is_dir() {
                pending.push(relative);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let metadata = item.metadata().map_err(io_err(&item.path()))?;
            let fs_mtime = mtime_millis(&metadata);
            seen.insert(key.clone());

            let current = entries.get(&key);
            if current.is_some_and(|e| e.is_live() && e.fs_mtime == fs_mtime && e.size == metadata.len()) {
                continue;
            }

            let content = std::fs::read(item.path()).map_err(io_err(&item.path()))?;
            let fingerprint = Fingerprint::of(&content);
            let same_content = current
                .is_some_and(|e| e.is_live() && e.fingerprint.as_ref() == Some(&fingerprint));
            let modified_at = match current {
                Some(e) if same_content => e.modified_at,
                _ => fs_mtime,
            };
            if !same_content {
                debug!(path = %key, "Indexed out-of-band change");
                changed += 1;
            }
            entries.insert(
                key,
                IndexEntry {
                    fingerprint: Some(fingerprint),
                    modified_at,
                    size: content.len() as u64,
                    tombstone: false,
                    fs_mtime,
                },
            );
        }
    }

    let now = now_millis();
    for (path, entry) in entries.iter_mut() {
        if entry.is_live() && !seen.contains(path) {
            debug!(path = %path, "Indexed out-of-band deletion");
            *entry = IndexEntry::tombstone(now);
            changed += 1;
        }
    }
    Ok(changed)
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Write through a temp file in the same directory, then rename.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.sync.tmp"));
    tokio::fs::write(&tmp, content).await.map_err(io_err(&tmp))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(path)(e));
    }
    Ok(())
}
