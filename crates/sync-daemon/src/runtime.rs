//! Client runtime: worker pool, poll timer and watcher forwarding around one
//! `IntakeQueue`.
//!
//! Shutdown order: stop the poll timer and watcher forwarding, close the
//! queue, let in-flight actions finish, flush metadata.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    ChangeNotice, FileSystem, IntakeQueue, MetadataStore, NoticeKind, Outcome,
    ReconciliationEngine, RemoteStore,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::http_remote::HttpRemoteStore;
use crate::native_fs::NativeFs;
use crate::watcher::FileWatcher;

/// Engine wired to the local disk and a sync-server.
pub type NativeEngine = ReconciliationEngine<NativeFs, HttpRemoteStore>;

/// Build the engine for `config`: native filesystem, HTTP remote and the
/// persisted metadata store.
pub fn build_engine(config: &ClientConfig) -> Result<NativeEngine> {
    std::fs::create_dir_all(&config.folder)
        .with_context(|| format!("Failed to create {}", config.folder.display()))?;
    let folder = config
        .folder
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", config.folder.display()))?;

    let metadata = MetadataStore::open(&config.state_file)
        .with_context(|| format!("Failed to open state file {}", config.state_file.display()))?;
    info!(entries = metadata.len(), "Loaded sync state");

    let remote = HttpRemoteStore::new(&config.server, config.engine.retry.request_timeout)?;
    Ok(ReconciliationEngine::new(
        NativeFs::new(folder),
        remote,
        metadata,
        config.engine.clone(),
    ))
}

/// Runtime tunables.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub workers: usize,
    pub poll_interval: Duration,
    pub queue_capacity: usize,
}

impl From<&ClientConfig> for RuntimeOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            workers: config.workers,
            poll_interval: config.poll_interval,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// Running client. Call `shutdown` to stop it cleanly.
pub struct SyncRuntime<F: FileSystem, R: RemoteStore> {
    engine: Arc<ReconciliationEngine<F, R>>,
    queue: Arc<IntakeQueue>,
    shutdown_tx: watch::Sender<bool>,
    producers: JoinSet<()>,
    workers: JoinSet<()>,
}

impl<F, R> SyncRuntime<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Spawn the workers, the poll timer and (when given) watcher forwarding.
    pub fn start(
        engine: Arc<ReconciliationEngine<F, R>>,
        watcher: Option<FileWatcher>,
        options: RuntimeOptions,
    ) -> Self {
        let queue = Arc::new(IntakeQueue::new(options.queue_capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = JoinSet::new();
        for id in 0..options.workers.max(1) {
            workers.spawn(worker(id, Arc::clone(&engine), Arc::clone(&queue)));
        }

        let mut producers = JoinSet::new();
        producers.spawn(poll_loop(
            Arc::clone(&engine),
            Arc::clone(&queue),
            options.poll_interval,
            shutdown_rx.clone(),
        ));
        if let Some(watcher) = watcher {
            producers.spawn(forward_watcher(watcher, Arc::clone(&queue), shutdown_rx));
        }

        info!(workers = options.workers, poll_interval = ?options.poll_interval, "Sync runtime started");
        Self {
            engine,
            queue,
            shutdown_tx,
            producers,
            workers,
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine<F, R>> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<IntakeQueue> {
        &self.queue
    }

    /// Stop intake, finish in-flight work and flush metadata.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Stopping sync runtime");
        // Receivers may already be gone if a producer exited on its own
        let _ = self.shutdown_tx.send(true);
        join_all(&mut self.producers).await;

        self.queue.close();
        join_all(&mut self.workers).await;

        self.engine.flush().context("Failed to flush sync state")?;
        info!("Sync runtime stopped");
        Ok(())
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            error!("Sync task ended abnormally: {}", e);
        }
    }
}

async fn worker<F: FileSystem, R: RemoteStore>(
    id: usize,
    engine: Arc<ReconciliationEngine<F, R>>,
    queue: Arc<IntakeQueue>,
) {
    while let Some(notice) = queue.next().await {
        let result = engine.process(&notice).await;
        queue.complete(&notice.path);

        match result {
            Ok(Outcome::InSync | Outcome::Ignored) => {
                trace!(worker = id, path = %notice.path, "Nothing to do");
            }
            Ok(outcome) => {
                debug!(worker = id, path = %notice.path, ?outcome, "Processed");
            }
            Err(e) if e.is_read() && notice.kind != NoticeKind::Deleted => {
                // Most likely deleted between notice and read
                debug!(path = %notice.path, "Read failed, re-checking as deletion: {}", e);
                let retry = ChangeNotice::new(notice.path.clone(), notice.origin, NoticeKind::Deleted);
                if !matches!(queue.try_push(retry), Ok(true)) {
                    debug!(path = %notice.path, "Queue full or closed, next poll will pick it up");
                }
            }
            // Already logged and recorded by the engine
            Err(_) => {}
        }
    }
    trace!(worker = id, "Worker stopped");
}

async fn poll_loop<F: FileSystem, R: RemoteStore>(
    engine: Arc<ReconciliationEngine<F, R>>,
    queue: Arc<IntakeQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            result = engine.poll(&queue) => match result {
                Ok(report) if report.enqueued > 0 => {
                    debug!(scanned = report.scanned, enqueued = report.enqueued, "Poll found changes");
                }
                Ok(_) => {}
                Err(e) => warn!("Poll failed: {}", e),
            },
        }
    }
    trace!("Poll timer stopped");
}

async fn forward_watcher(
    mut watcher: FileWatcher,
    queue: Arc<IntakeQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            notice = watcher.event_rx().recv() => {
                let Some(notice) = notice else { break };
                if queue.push(notice).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!("Watcher forwarding stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{EngineConfig, InMemoryFs, InMemoryRemote, RetryConfig};

    fn options() -> RuntimeOptions {
        RuntimeOptions {
            workers: 2,
            poll_interval: Duration::from_millis(20),
            queue_capacity: 16,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_poll_timer_drives_sync_both_ways() {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        fs.write_at("up.txt", b"local", 10).await;
        remote.put("down.txt", b"remote", 10);

        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&fs),
            Arc::clone(&remote),
            MetadataStore::in_memory(),
            EngineConfig {
                retry: RetryConfig::immediate(2),
                ..Default::default()
            },
        ));
        let runtime = SyncRuntime::start(Arc::clone(&engine), None, options());

        wait_for(|| remote.content("up.txt").is_some() && fs.content("down.txt").is_some()).await;
        runtime.shutdown().await.unwrap();

        assert_eq!(remote.content("up.txt").unwrap(), b"local");
        assert_eq!(fs.content("down.txt").unwrap(), b"remote");
        assert_eq!(engine.metadata().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue_and_flushes_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let state_file = dir.path().join("state.json");
        let fs = Arc::new(InMemoryFs::new());
        fs.write_at("a.txt", b"A", 10).await;

        let engine = Arc::new(ReconciliationEngine::new(
            Arc::clone(&fs),
            Arc::new(InMemoryRemote::new()),
            MetadataStore::open(&state_file).unwrap(),
            EngineConfig::default(),
        ));
        let runtime = SyncRuntime::start(Arc::clone(&engine), None, options());
        let queue = Arc::clone(runtime.queue());

        wait_for(|| engine.metadata().get("a.txt").is_some()).await;
        runtime.shutdown().await.unwrap();

        assert!(queue.is_closed());
        let reloaded = MetadataStore::open(&state_file).unwrap();
        assert!(reloaded.get("a.txt").is_some());
    }
}
