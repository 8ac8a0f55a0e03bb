//! File watcher with debouncing for the synced folder.
//!
//! Uses notify-debouncer-mini for efficient file change detection and turns
//! raw events into `ChangeNotice`s for the intake queue.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use sync_core::{ChangeNotice, IgnoreRules, NoticeKind, NoticeOrigin};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Debounce window for bursts of events during a save
pub const DEBOUNCE: Duration = Duration::from_millis(200);

/// File watcher that monitors the synced folder.
pub struct FileWatcher {
    /// Watched root
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for change notices
    event_rx: mpsc::UnboundedReceiver<ChangeNotice>,
}

/// Last seen mtime per relative path, to filter spurious events and tell
/// creations from modifications.
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

impl FileWatcher {
    /// Create a new file watcher for `root`.
    pub fn new(root: PathBuf, ignore: IgnoreRules) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let Some(notice) =
                            Self::process_event(&event, &root_clone, &ignore, &mtime_cache)
                        else {
                            continue;
                        };
                        if event_tx.send(notice).is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Process a single debounced event, returning a notice if relevant.
    fn process_event(
        event: &DebouncedEvent,
        root: &Path,
        ignore: &IgnoreRules,
        mtime_cache: &MtimeCache,
    ) -> Option<ChangeNotice> {
        let path = &event.path;
        let relative = relative_path(root, path)?;
        if ignore.is_ignored(&relative) {
            trace!(path = %relative, "Ignoring event");
            return None;
        }

        // The debouncer collapses event kinds, so the filesystem decides.
        // A rename shows up as the old path gone and the new one present.
        let metadata = std::fs::metadata(path).ok();
        if metadata.as_ref().is_some_and(|m| m.is_dir()) {
            return None;
        }

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let kind = match metadata.and_then(|m| m.modified().ok()) {
            Some(mtime) => match cache.insert(relative.clone(), mtime) {
                // Mtime unchanged: spurious event (seen on Docker volumes)
                Some(last) if last == mtime => return None,
                Some(_) => NoticeKind::Modified,
                None => NoticeKind::Created,
            },
            None if path.exists() => NoticeKind::Modified,
            None => {
                cache.remove(&relative);
                NoticeKind::Deleted
            }
        };
        drop(cache);

        debug!(path = %relative, ?kind, "File event");
        Some(ChangeNotice::new(relative, NoticeOrigin::Watcher, kind))
    }

    /// Get the receiver for change notices.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<ChangeNotice> {
        &mut self.event_rx
    }

    /// Get the watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// `/`-separated path of `path` below `root`, None outside the root.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
