//! MetadataStore: last reconciled state per path.
//!
//! Stored in `.sync/state.json` within the synced folder when opened from
//! disk. Every mutation is written through so a restart resumes from the
//! last committed action. Paths missing after a restart are simply unknown
//! and get a full re-comparison.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::ignore::SYNC_DIR;
use crate::types::SyncState;

/// File name of the persisted state within `.sync/`
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// On-disk format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    entries: BTreeMap<String, SyncState>,
}

const FORMAT_VERSION: u32 = 1;

type LockMap = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Held while a path is being reconciled; dropping it releases the path.
pub struct PathGuard {
    path: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl PathGuard {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // Release first so the map holds the last reference when idle
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(&self.path).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.path);
        }
    }
}

pub struct MetadataStore {
    entries: RwLock<HashMap<String, SyncState>>,
    /// One async mutex per path, created on demand and dropped with the
    /// last guard
    locks: LockMap,
    /// Where to persist (None = memory only)
    file: Option<PathBuf>,
    /// Serializes writes of the state file
    save_lock: Mutex<()>,
}

impl MetadataStore {
    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locks: LockMap::default(),
            file: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Default state file location for a synced root.
    pub fn default_path(root: &Path) -> PathBuf {
        root.join(SYNC_DIR).join(STATE_FILE)
    }

    /// Open (or create) a store persisted at `file`.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let entries = Self::load(&file)?;
        debug!(path = %file.display(), entries = entries.len(), "Loaded sync state");
        Ok(Self {
            entries: RwLock::new(entries),
            locks: LockMap::default(),
            file: Some(file),
            save_lock: Mutex::new(()),
        })
    }

    fn load(file: &Path) -> Result<HashMap<String, SyncState>> {
        if !file.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(file).map_err(|source| MetadataError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        let persisted: PersistedState =
            serde_json::from_str(&contents).map_err(|source| MetadataError::Corrupt {
                path: file.to_path_buf(),
                source,
            })?;
        if persisted.version != FORMAT_VERSION {
            warn!(
                version = persisted.version,
                "Unknown state file version, starting from unknown state"
            );
            return Ok(HashMap::new());
        }
        Ok(persisted.entries.into_iter().collect())
    }

    /// Acquire exclusive access to `path` for a read-decide-commit cycle.
    pub async fn lock(&self, path: &str) -> PathGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(path.to_string()).or_default())
        };
        PathGuard {
            path: path.to_string(),
            guard: Some(mutex.lock_owned().await),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Paths with a live lock entry (held or waited on).
    pub fn locked_paths(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn get(&self, path: &str) -> Option<SyncState> {
        self.read_entries().get(path).cloned()
    }

    pub fn put(&self, state: SyncState) -> Result<()> {
        self.write_entries().insert(state.path.clone(), state);
        self.save()
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let removed = self.write_entries().remove(path).is_some();
        if removed {
            self.save()?;
        }
        Ok(())
    }

    /// Every recorded path, sorted.
    pub fn list_all(&self) -> Vec<SyncState> {
        let mut all: Vec<_> = self.read_entries().values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current state to disk (no-op for in-memory stores).
    pub fn save(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _saving = self.save_lock.lock().unwrap_or_else(|e| e.into_inner());

        let persisted = PersistedState {
            version: FORMAT_VERSION,
            entries: self
                .read_entries()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let contents = serde_json::to_string_pretty(&persisted).map_err(|source| {
            MetadataError::Corrupt {
                path: file.clone(),
                source,
            }
        })?;

        let io_err = |source| MetadataError::Io {
            path: file.clone(),
            source,
        };
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Write-then-rename so a crash never leaves a torn file
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(io_err)?;
        std::fs::rename(&tmp, file).map_err(io_err)?;
        Ok(())
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SyncState>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SyncState>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
