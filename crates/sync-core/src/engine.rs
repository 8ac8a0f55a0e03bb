//! ReconciliationEngine: turns change notices into committed sync actions.
//!
//! Watcher notices and poll diffs are treated alike. For each notice the
//! engine takes the path lock, observes both sides afresh, runs the decision
//! procedure and hands the result to the executor. Because the observation
//! happens under the lock, a notice that arrives late or twice finds the
//! state already committed and decides `InSync`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SyncEvent};
use crate::executor::{ActionExecutor, Applied, ExecError};
use crate::fs::{FileStat, FileSystem, FsError, walk_files};
use crate::hash_index::{HashIndex, HashIndexError};
use crate::ignore::IgnoreRules;
use crate::metadata::{MetadataError, MetadataStore, PathGuard};
use crate::queue::{IntakeQueue, QueueError};
use crate::reconcile::decide;
use crate::remote::{RemoteEntry, RemoteError, RemoteStore};
use crate::retry::{RetryConfig, with_retry};
use crate::types::{
    Action, ChangeNotice, Decision, FileRecord, Fingerprint, NoticeKind, NoticeOrigin, SyncState,
    SyncStatus, TieBreak, now_millis,
};

/// How often a decision is retried when the local file keeps changing
/// underneath the executor.
const MAX_STALE_ROUNDS: usize = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The local file exists but could not be read. The caller re-enqueues
    /// the path as `Deleted` so a vanished file is picked up as a deletion.
    #[error(transparent)]
    Read(#[from] HashIndexError),

    #[error("Failed to scan local folder: {0}")]
    Scan(#[source] FsError),

    #[error("Remote {operation} failed after {attempts} attempts: {source}")]
    Remote {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl EngineError {
    pub fn is_read(&self) -> bool {
        matches!(self, EngineError::Read(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Result of processing one notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Path matches an ignore rule
    Ignored,
    /// Nothing to do
    InSync,
    /// An action was applied (or a convergent state recorded)
    Applied { action: Action, status: SyncStatus },
    /// Both sides deleted; metadata dropped
    Purged,
    /// Conflict without timestamps; local content kept
    Ambiguous,
}

/// A path that could not be synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub path: String,
    /// Attempts made across all rounds since the first failure
    pub attempts: u32,
    pub last_error: String,
    /// First failure, ms since epoch
    pub since: u64,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Distinct paths examined
    pub scanned: usize,
    /// Notices pushed to the queue
    pub enqueued: usize,
}

/// Engine tunables.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub tie_break: TieBreak,
    pub retry: RetryConfig,
    pub ignore: IgnoreRules,
}

pub struct ReconciliationEngine<F: FileSystem, R: RemoteStore> {
    hashes: Arc<HashIndex<F>>,
    metadata: Arc<MetadataStore>,
    remote: Arc<R>,
    executor: ActionExecutor<F, R>,
    config: EngineConfig,
    events: Arc<EventBus>,
    failures: Mutex<BTreeMap<String, SyncFailure>>,
}

impl<F: FileSystem, R: RemoteStore> ReconciliationEngine<F, R> {
    pub fn new(fs: F, remote: R, metadata: MetadataStore, config: EngineConfig) -> Self {
        let hashes = Arc::new(HashIndex::new(fs));
        let metadata = Arc::new(metadata);
        let remote = Arc::new(remote);
        let executor = ActionExecutor::new(
            Arc::clone(&hashes),
            Arc::clone(&metadata),
            Arc::clone(&remote),
            config.retry.clone(),
        );
        Self {
            hashes,
            metadata,
            remote,
            executor,
            config,
            events: Arc::new(EventBus::new()),
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn hashes(&self) -> &HashIndex<F> {
        &self.hashes
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Paths currently failing, sorted.
    pub fn failures(&self) -> Vec<SyncFailure> {
        self.lock_failures().values().cloned().collect()
    }

    /// Write metadata to disk.
    pub fn flush(&self) -> Result<()> {
        self.metadata.save()?;
        Ok(())
    }

    /// Reconcile the path named by `notice`.
    pub async fn process(&self, notice: &ChangeNotice) -> Result<Outcome> {
        let path = notice.path.as_str();
        if self.config.ignore.is_ignored(path) {
            return Ok(Outcome::Ignored);
        }

        let guard = self.metadata.lock(path).await;
        let result = self.process_locked(&guard, notice).await;

        match &result {
            Ok(Outcome::Ambiguous) => {}
            Ok(_) => self.clear_failure(path),
            // Re-enqueued as a deletion by the caller unless it already was one
            Err(EngineError::Read(_)) if notice.kind != NoticeKind::Deleted => {}
            Err(e) => self.record_failure(path, e),
        }
        result
    }

    async fn process_locked(&self, guard: &PathGuard, notice: &ChangeNotice) -> Result<Outcome> {
        let path = guard.path();

        for round in 1..=MAX_STALE_ROUNDS {
            let previous = self.metadata.get(path);
            let local = self
                .observe_local(path, previous.as_ref(), notice.observed_at)
                .await?;
            let entry = self.fetch_remote_entry(path).await?;
            let remote = remote_record(path, previous.as_ref(), entry.as_ref());

            let decision = decide(path, previous.as_ref(), local, remote, self.config.tie_break);
            debug!(
                path,
                origin = ?notice.origin,
                kind = ?notice.kind,
                status = ?decision.status,
                action = %decision.action,
                "Decided"
            );

            if decision.is_noop() {
                if decision.is_ambiguous() {
                    return Ok(self.surface_ambiguous(path));
                }
                return Ok(Outcome::InSync);
            }

            match self.executor.apply(guard, &decision).await {
                Ok(applied) => return Ok(self.report(&decision, applied)),
                Err(ExecError::Stale { .. }) if round < MAX_STALE_ROUNDS => {
                    debug!(path, round, "Local file changed during sync, deciding again");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExecError::Stale {
            path: path.to_string(),
        }
        .into())
    }

    /// Current local record, or the tombstone a vanished file leaves behind.
    async fn observe_local(
        &self,
        path: &str,
        previous: Option<&SyncState>,
        observed_at: u64,
    ) -> Result<Option<FileRecord>> {
        let exists = self
            .hashes
            .fs()
            .exists(path)
            .await
            .map_err(|source| HashIndexError::Read {
                path: path.to_string(),
                source,
            })?;
        if !exists {
            return Ok(absent_local(path, previous, observed_at));
        }

        let (stat, fingerprint) = self.hashes.observe(path).await?;
        Ok(Some(live_local(path, &stat, fingerprint)))
    }

    async fn fetch_remote_entry(&self, path: &str) -> Result<Option<RemoteEntry>> {
        with_retry("entry", &self.config.retry, || self.remote.entry(path))
            .await
            .map_err(|e| EngineError::Remote {
                operation: "entry",
                attempts: e.attempts,
                source: e.last_error,
            })
    }

    fn surface_ambiguous(&self, path: &str) -> Outcome {
        warn!(path, "Conflict without timestamps on either side, keeping local copy");
        self.events.emit(SyncEvent::ConflictAmbiguous {
            path: path.to_string(),
            timestamp: now_millis(),
        });
        self.note_failure(path, 1, "conflict has no timestamps; local copy kept".to_string());
        Outcome::Ambiguous
    }

    fn report(&self, decision: &Decision, applied: Applied) -> Outcome {
        let path = decision.path.as_str();
        let timestamp = now_millis();

        if applied.purged {
            self.events.emit(SyncEvent::Purged {
                path: path.to_string(),
                timestamp,
            });
            return Outcome::Purged;
        }
        if applied.committed.is_none() {
            return Outcome::InSync;
        }

        if let Some(resolution) = decision.conflict {
            info!(path, ?resolution, action = %applied.action, "Resolved conflict");
            self.events.emit(SyncEvent::ConflictResolved {
                path: path.to_string(),
                resolution,
                action: applied.action,
                timestamp,
            });
        }
        self.events.emit(SyncEvent::ActionApplied {
            path: path.to_string(),
            action: applied.action,
            status: decision.status,
            timestamp,
        });
        Outcome::Applied {
            action: applied.action,
            status: decision.status,
        }
    }

    /// Full listing diff: enqueue every path whose state needs attention.
    pub async fn poll(&self, queue: &IntakeQueue) -> Result<PollReport> {
        let listing = with_retry("list", &self.config.retry, || self.remote.list())
            .await
            .map_err(|e| EngineError::Remote {
                operation: "list",
                attempts: e.attempts,
                source: e.last_error,
            })?;
        let remote_entries: HashMap<String, RemoteEntry> = listing
            .into_iter()
            .filter(|e| !self.config.ignore.is_ignored(&e.path))
            .map(|e| (e.path.clone(), e))
            .collect();

        let local_files: HashSet<String> = walk_files(self.hashes.fs(), &self.config.ignore)
            .await
            .map_err(EngineError::Scan)?
            .into_iter()
            .collect();

        let failed: HashSet<String> = self.lock_failures().keys().cloned().collect();

        let mut paths: BTreeSet<String> = BTreeSet::new();
        paths.extend(local_files.iter().cloned());
        paths.extend(remote_entries.keys().cloned());
        paths.extend(self.metadata.list_all().into_iter().map(|s| s.path));
        paths.extend(failed.iter().cloned());

        let now = now_millis();
        let mut report = PollReport {
            scanned: paths.len(),
            enqueued: 0,
        };

        for path in paths {
            if self.config.ignore.is_ignored(&path) {
                continue;
            }
            let previous = self.metadata.get(&path);
            let kind = if failed.contains(&path) {
                Some(NoticeKind::Modified)
            } else {
                self.poll_candidate(
                    &path,
                    previous.as_ref(),
                    local_files.contains(&path),
                    remote_entries.get(&path),
                    now,
                )
                .await
            };

            if let Some(kind) = kind {
                queue
                    .push(ChangeNotice::at(path, NoticeOrigin::Poll, kind, now))
                    .await?;
                report.enqueued += 1;
            }
        }

        debug!(scanned = report.scanned, enqueued = report.enqueued, "Poll completed");
        self.events.emit(SyncEvent::PollCompleted {
            scanned: report.scanned,
            enqueued: report.enqueued,
            timestamp: now_millis(),
        });
        Ok(report)
    }

    /// Notice kind for a path that needs work, None when it is settled.
    async fn poll_candidate(
        &self,
        path: &str,
        previous: Option<&SyncState>,
        local_exists: bool,
        entry: Option<&RemoteEntry>,
        now: u64,
    ) -> Option<NoticeKind> {
        let local = if local_exists {
            match self.hashes.observe(path).await {
                Ok((stat, fp)) => Some(live_local(path, &stat, fp)),
                // Let the worker sort it out under the lock
                Err(_) => return Some(NoticeKind::Modified),
            }
        } else {
            absent_local(path, previous, now)
        };
        let remote = remote_record(path, previous, entry);

        let decision = decide(path, previous, local, remote, self.config.tie_break);
        if decision.status == SyncStatus::BothDeleted && previous.is_none() {
            // Tombstone on the remote for a path this client never had
            return None;
        }
        if decision.is_noop() && !decision.is_ambiguous() {
            return None;
        }

        Some(match decision.action {
            Action::DeleteLocal | Action::DeleteRemote => NoticeKind::Deleted,
            _ if previous.is_none() => NoticeKind::Created,
            _ => NoticeKind::Modified,
        })
    }

    fn record_failure(&self, path: &str, error: &EngineError) {
        let attempts = match error {
            EngineError::Remote { attempts, .. } => *attempts,
            EngineError::Exec(ExecError::Transfer { attempts, .. }) => *attempts,
            _ => 1,
        };
        warn!(path, attempts, "Sync failed: {}", error);
        self.note_failure(path, attempts, error.to_string());
    }

    fn note_failure(&self, path: &str, attempts: u32, error: String) {
        let total = {
            let mut failures = self.lock_failures();
            let failure = failures
                .entry(path.to_string())
                .or_insert_with(|| SyncFailure {
                    path: path.to_string(),
                    attempts: 0,
                    last_error: String::new(),
                    since: now_millis(),
                });
            failure.attempts += attempts;
            failure.last_error = error.clone();
            failure.attempts
        };
        self.events.emit(SyncEvent::SyncFailed {
            path: path.to_string(),
            attempts: total,
            error,
            timestamp: now_millis(),
        });
    }

    fn clear_failure(&self, path: &str) {
        if self.lock_failures().remove(path).is_some() {
            info!(path, "Recovered from earlier failure");
        }
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SyncFailure>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Local side for a path that is not on disk.
///
/// A path this client never recorded stays unknown; a recorded live file
/// becomes a tombstone stamped with when its absence was observed.
fn absent_local(path: &str, previous: Option<&SyncState>, observed_at: u64) -> Option<FileRecord> {
    match previous.and_then(|s| s.local.as_ref()) {
        Some(record) if record.tombstone => Some(record.clone()),
        Some(_) => Some(FileRecord::tombstone(path, Some(observed_at))),
        None => None,
    }
}

/// Local live record. An mtime of 0 means the filesystem gave none.
fn live_local(path: &str, stat: &FileStat, fingerprint: Fingerprint) -> FileRecord {
    let modified_at = Some(stat.mtime_millis).filter(|&t| t > 0);
    FileRecord::live(path, fingerprint, modified_at, stat.size)
}

/// Remote side from its inventory entry. A recorded path the remote no
/// longer lists counts as deleted at an unknown time.
fn remote_record(
    path: &str,
    previous: Option<&SyncState>,
    entry: Option<&RemoteEntry>,
) -> Option<FileRecord> {
    match entry {
        Some(entry) => Some(entry.to_record()),
        None => match previous.and_then(|s| s.remote.as_ref()) {
            Some(record) if record.tombstone => Some(record.clone()),
            Some(_) => Some(FileRecord::tombstone(path, None)),
            None => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::remote::InMemoryRemote;
    type Engine = ReconciliationEngine<Arc<InMemoryFs>, Arc<InMemoryRemote>>;

    fn engine() -> (Engine, Arc<InMemoryFs>, Arc<InMemoryRemote>) {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        let config = EngineConfig {
            retry: RetryConfig::immediate(2),
            ..Default::default()
        };
        let engine = ReconciliationEngine::new(
            Arc::clone(&fs),
            Arc::clone(&remote),
            MetadataStore::in_memory(),
            config,
        );
        (engine, fs, remote)
    }

    fn modified(path: &str) -> ChangeNotice {
        ChangeNotice::new(path, NoticeOrigin::Watcher, NoticeKind::Modified)
    }

    #[tokio::test]
    async fn test_new_local_file_is_uploaded() {
        let (engine, fs, remote) = engine();
        fs.write_at("a.txt", b"X", 100).await;

        let outcome = engine.process(&modified("a.txt")).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                action: Action::Upload,
                status: SyncStatus::LocalOnly
            }
        );
        assert_eq!(remote.content("a.txt").unwrap(), b"X");

        // Duplicate notice is harmless
        assert_eq!(engine.process(&modified("a.txt")).await.unwrap(), Outcome::InSync);
        assert_eq!(remote.upload_count(), 1);
    }

    #[tokio::test]
    async fn test_ignored_paths_are_skipped() {
        let (engine, fs, remote) = engine();
        fs.write_at("notes.swp", b"X", 100).await;

        assert_eq!(engine.process(&modified("notes.swp")).await.unwrap(), Outcome::Ignored);
        assert_eq!(remote.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_conflict_is_surfaced_as_failure() {
        let (engine, fs, remote) = engine();
        fs.write_at("a.txt", b"X", 100).await;
        engine.process(&modified("a.txt")).await.unwrap();
        let before = engine.metadata().get("a.txt").unwrap();

        // Neither side can say when it changed
        fs.write_at("a.txt", b"L", 0).await;
        remote.put("a.txt", b"R", 300);
        remote.omit_timestamps();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = engine.events().subscribe(move |event| {
            if let SyncEvent::ConflictAmbiguous { path, .. } = event {
                sink.lock().unwrap().push(path);
            }
        });

        let outcome = engine.process(&modified("a.txt")).await.unwrap();
        assert_eq!(outcome, Outcome::Ambiguous);
        assert_eq!(engine.metadata().get("a.txt"), Some(before));
        assert_eq!(fs.content("a.txt").unwrap(), b"L");
        assert_eq!(remote.content("a.txt").unwrap(), b"R");
        assert_eq!(remote.upload_count(), 1);
        assert_eq!(remote.download_count(), 0);
        assert_eq!(*seen.lock().unwrap(), vec!["a.txt".to_string()]);
        let failures = engine.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "a.txt");
    }

    #[tokio::test]
    async fn test_transfer_failure_is_logged_then_cleared() {
        let (engine, fs, remote) = engine();
        fs.write_at("a.txt", b"X", 100).await;
        // Both upload attempts fail; the entry lookup goes through
        remote.fail_uploads(2);

        let err = engine.process(&modified("a.txt")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Exec(ExecError::Transfer { attempts: 2, .. })
        ));
        let failures = engine.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "a.txt");
        assert_eq!(failures[0].attempts, 2);
        assert!(engine.metadata().get("a.txt").is_none());
        assert!(remote.content("a.txt").is_none());

        let outcome = engine.process(&modified("a.txt")).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                action: Action::Upload,
                status: SyncStatus::LocalOnly
            }
        );
        assert!(engine.failures().is_empty());
        assert_eq!(remote.content("a.txt").unwrap(), b"X");
    }

    #[tokio::test]
    async fn test_newer_remote_tombstone_deletes_unknown_local_file() {
        let (engine, fs, remote) = engine();
        fs.write_at("d.txt", b"old", 10).await;
        remote.remove("d.txt", 500);

        let outcome = engine.process(&modified("d.txt")).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                action: Action::DeleteLocal,
                status: SyncStatus::Conflict
            }
        );
        assert!(fs.content("d.txt").is_none());
        assert!(remote.content("d.txt").is_none());
        assert_eq!(remote.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_releases_path_lock() {
        let (engine, fs, remote) = engine();
        fs.write_at("b.txt", b"B", 100).await;
        engine.process(&modified("b.txt")).await.unwrap();

        fs.remove("b.txt");
        let deleted = ChangeNotice::new("b.txt", NoticeOrigin::Watcher, NoticeKind::Deleted);
        engine.process(&deleted).await.unwrap();
        assert!(remote.content("b.txt").is_none());

        assert_eq!(engine.process(&deleted).await.unwrap(), Outcome::Purged);
        assert!(engine.metadata().get("b.txt").is_none());
        assert_eq!(engine.metadata().locked_paths(), 0);
    }

    #[tokio::test]
    async fn test_poll_enqueues_only_unsettled_paths() {
        let (engine, fs, remote) = engine();
        fs.write_at("local.txt", b"L", 100).await;
        remote.put("remote.txt", b"R", 100);
        fs.write_at("same.txt", b"S", 100).await;
        engine.process(&modified("same.txt")).await.unwrap();

        let queue = IntakeQueue::new(16);
        let report = engine.poll(&queue).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.enqueued, 2);

        let first = queue.next().await.unwrap();
        let second = queue.next().await.unwrap();
        assert_eq!(first.path, "local.txt");
        assert_eq!(first.kind, NoticeKind::Created);
        assert_eq!(second.path, "remote.txt");
        assert_eq!(second.origin, NoticeOrigin::Poll);
    }

    #[tokio::test]
    async fn test_poll_ignores_foreign_tombstones() {
        let (engine, _fs, remote) = engine();
        remote.remove("gone.txt", 10);

        let queue = IntakeQueue::new(16);
        let report = engine.poll(&queue).await.unwrap();
        assert_eq!(report.enqueued, 0);
    }

    #[tokio::test]
    async fn test_remote_unreachable_is_an_error_not_a_panic() {
        let (engine, fs, remote) = engine();
        fs.write_at("a.txt", b"X", 100).await;
        remote.fail_next(5);

        let err = engine.process(&modified("a.txt")).await.unwrap_err();
        assert!(matches!(err, EngineError::Remote { operation: "entry", .. }));
        assert_eq!(engine.failures()[0].attempts, 2);
    }
}
