//! Scenario tests for the reconciliation engine.
//!
//! Drives the engine with in-memory doubles on both sides, the same way the
//! daemon drives it with real ones: notices go through an `IntakeQueue` and
//! a poll cycle catches whatever the watcher missed.

use std::sync::{Arc, Mutex};

use sync_core::{
    Action, ChangeNotice, ConflictResolution, EngineConfig, Fingerprint, InMemoryFs,
    InMemoryRemote, IntakeQueue, MetadataStore, NoticeKind, NoticeOrigin, Outcome,
    ReconciliationEngine, RetryConfig, Side, SyncEvent, SyncStatus,
};

type Engine = ReconciliationEngine<Arc<InMemoryFs>, Arc<InMemoryRemote>>;

struct World {
    engine: Engine,
    fs: Arc<InMemoryFs>,
    remote: Arc<InMemoryRemote>,
    queue: IntakeQueue,
}

impl World {
    fn new() -> Self {
        let fs = Arc::new(InMemoryFs::new());
        let remote = Arc::new(InMemoryRemote::new());
        let engine = ReconciliationEngine::new(
            Arc::clone(&fs),
            Arc::clone(&remote),
            MetadataStore::in_memory(),
            EngineConfig {
                retry: RetryConfig::immediate(2),
                ..Default::default()
            },
        );
        Self {
            engine,
            fs,
            remote,
            queue: IntakeQueue::new(64),
        }
    }

    /// Put identical content on both sides and record it as reconciled.
    async fn synced(&self, path: &str, content: &[u8], ts: u64) {
        self.fs.write_at(path, content, ts).await;
        self.remote.put(path, content, ts);
        let outcome = self.engine.process(&watcher(path, NoticeKind::Created)).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Applied {
                action: Action::None,
                status: SyncStatus::InSync
            }
        );
    }

    /// Process everything queued, the way a single worker would.
    async fn drain(&self) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while !self.queue.is_empty() {
            let notice = self.queue.next().await.unwrap();
            if let Ok(outcome) = self.engine.process(&notice).await {
                outcomes.push(outcome);
            }
            self.queue.complete(&notice.path);
        }
        outcomes
    }

    /// Poll then drain until a poll finds nothing left to do.
    async fn settle(&self) {
        for _ in 0..5 {
            let report = self.engine.poll(&self.queue).await.unwrap();
            if report.enqueued == 0 {
                return;
            }
            self.drain().await;
        }
        panic!("did not converge");
    }
}

fn watcher(path: &str, kind: NoticeKind) -> ChangeNotice {
    ChangeNotice::new(path, NoticeOrigin::Watcher, kind)
}

#[tokio::test]
async fn test_conflict_later_remote_edit_wins() {
    let world = World::new();
    world.fs.write_at("a.txt", b"X", 100).await;
    let outcome = world
        .engine
        .process(&watcher("a.txt", NoticeKind::Created))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Applied {
            action: Action::Upload,
            status: SyncStatus::LocalOnly
        }
    );
    assert_eq!(world.remote.content("a.txt").unwrap(), b"X");
    let state = world.engine.metadata().get("a.txt").unwrap();
    assert_eq!(state.remote.unwrap().fingerprint, Some(Fingerprint::of(b"X")));

    let resolutions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&resolutions);
    let _sub = world.engine.events().subscribe(move |event| {
        if let SyncEvent::ConflictResolved { resolution, .. } = event {
            sink.lock().unwrap().push(resolution);
        }
    });

    world.fs.write_at("a.txt", b"Z", 200).await;
    world.remote.put("a.txt", b"Y", 300);

    let outcome = world
        .engine
        .process(&watcher("a.txt", NoticeKind::Modified))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Applied {
            action: Action::Download,
            status: SyncStatus::Conflict
        }
    );
    assert_eq!(world.fs.content("a.txt").unwrap(), b"Y");
    assert_eq!(world.remote.content("a.txt").unwrap(), b"Y");
    assert_eq!(
        *resolutions.lock().unwrap(),
        vec![ConflictResolution::NewerWins(Side::Remote)]
    );

    let state = world.engine.metadata().get("a.txt").unwrap();
    assert_eq!(state.local.unwrap().fingerprint, Some(Fingerprint::of(b"Y")));
    assert_eq!(
        world
            .engine
            .process(&watcher("a.txt", NoticeKind::Modified))
            .await
            .unwrap(),
        Outcome::InSync
    );
}

#[tokio::test]
async fn test_deletion_propagates_then_purges() {
    let world = World::new();
    world.synced("b.txt", b"X", 1).await;

    world.fs.remove("b.txt");
    let outcome = world
        .engine
        .process(&watcher("b.txt", NoticeKind::Deleted))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Applied {
            action: Action::DeleteRemote,
            status: SyncStatus::LocalAhead
        }
    );
    assert!(world.remote.content("b.txt").is_none());
    assert!(world.engine.metadata().get("b.txt").unwrap().both_tombstoned());

    // Next cycle sees both sides deleted and drops the entry
    let report = world.engine.poll(&world.queue).await.unwrap();
    assert_eq!(report.enqueued, 1);
    assert_eq!(world.drain().await, vec![Outcome::Purged]);
    assert!(world.engine.metadata().get("b.txt").is_none());

    // The remote tombstone alone does not bring it back
    assert_eq!(world.engine.poll(&world.queue).await.unwrap().enqueued, 0);
    assert!(world.fs.content("b.txt").is_none());
}

#[tokio::test]
async fn test_modify_then_delete_coalesces_to_single_delete() {
    let world = World::new();
    world.synced("c.txt", b"X", 1).await;
    let uploads_before = world.remote.upload_count();

    world.fs.write_at("c.txt", b"edit", 5).await;
    world.queue.push(watcher("c.txt", NoticeKind::Modified)).await.unwrap();
    world.fs.remove("c.txt");
    world.queue.push(watcher("c.txt", NoticeKind::Deleted)).await.unwrap();
    assert_eq!(world.queue.len(), 1);

    let outcomes = world.drain().await;
    assert_eq!(
        outcomes,
        vec![Outcome::Applied {
            action: Action::DeleteRemote,
            status: SyncStatus::LocalAhead
        }]
    );
    assert_eq!(world.remote.upload_count(), uploads_before);
    assert!(world.remote.content("c.txt").is_none());
}

#[tokio::test]
async fn test_duplicate_notices_are_idempotent() {
    let world = World::new();
    world.fs.write_at("a.txt", b"X", 1).await;

    let notice = watcher("a.txt", NoticeKind::Created);
    world.engine.process(&notice).await.unwrap();
    let transfers = world.remote.transfer_count();

    for origin in [NoticeOrigin::Watcher, NoticeOrigin::Poll] {
        let again = ChangeNotice::new("a.txt", origin, NoticeKind::Modified);
        assert_eq!(world.engine.process(&again).await.unwrap(), Outcome::InSync);
    }
    assert_eq!(world.remote.transfer_count(), transfers);
}

#[tokio::test]
async fn test_touch_without_edit_transfers_nothing() {
    let world = World::new();
    world.synced("a.txt", b"X", 1).await;
    let transfers = world.remote.transfer_count();

    world.fs.set_mtime("a.txt", 999);
    let report = world.engine.poll(&world.queue).await.unwrap();

    assert_eq!(report.enqueued, 0);
    assert_eq!(
        world
            .engine
            .process(&watcher("a.txt", NoticeKind::Modified))
            .await
            .unwrap(),
        Outcome::InSync
    );
    assert_eq!(world.remote.transfer_count(), transfers);
}

#[tokio::test]
async fn test_both_sides_converge() {
    let world = World::new();
    world.synced("kept.txt", b"same", 1).await;
    world.synced("edited-here.txt", b"old", 1).await;
    world.synced("edited-there.txt", b"old", 1).await;
    world.synced("deleted-here.txt", b"old", 1).await;
    world.synced("deleted-there.txt", b"old", 1).await;

    world.fs.write_at("new-here.txt", b"n1", 5).await;
    world.remote.put("new-there.txt", b"n2", 5);
    world.fs.write_at("edited-here.txt", b"new", 5).await;
    world.remote.put("edited-there.txt", b"new", 5);
    world.fs.remove("deleted-here.txt");
    world.remote.remove("deleted-there.txt", 5);
    world.fs.write_at("nested/deep.txt", b"d", 5).await;

    world.settle().await;

    let listing = sync_core::RemoteStore::list(&*world.remote).await.unwrap();
    let mut live_remote: Vec<_> = listing
        .iter()
        .filter(|e| !e.tombstone)
        .map(|e| e.path.clone())
        .collect();
    live_remote.sort();
    assert_eq!(
        live_remote,
        vec![
            "edited-here.txt",
            "edited-there.txt",
            "kept.txt",
            "nested/deep.txt",
            "new-here.txt",
            "new-there.txt",
        ]
    );
    for path in &live_remote {
        assert_eq!(world.fs.content(path), world.remote.content(path), "{path}");
    }
    assert!(world.fs.content("deleted-here.txt").is_none());
    assert!(world.fs.content("deleted-there.txt").is_none());
    assert!(world.engine.failures().is_empty());
}

#[tokio::test]
async fn test_conflict_outcome_does_not_depend_on_signal_order() {
    async fn run(first: NoticeOrigin) -> Vec<u8> {
        let world = World::new();
        world.synced("a.txt", b"X", 1).await;
        world.fs.write_at("a.txt", b"local", 30).await;
        world.remote.put("a.txt", b"remote", 20);

        let second = match first {
            NoticeOrigin::Watcher => NoticeOrigin::Poll,
            NoticeOrigin::Poll => NoticeOrigin::Watcher,
        };
        for origin in [first, second] {
            let notice = ChangeNotice::new("a.txt", origin, NoticeKind::Modified);
            world.engine.process(&notice).await.unwrap();
        }
        world.remote.content("a.txt").unwrap()
    }

    let watcher_first = run(NoticeOrigin::Watcher).await;
    let poll_first = run(NoticeOrigin::Poll).await;
    assert_eq!(watcher_first, b"local");
    assert_eq!(watcher_first, poll_first);
}

#[tokio::test]
async fn test_failing_path_does_not_block_others_and_recovers() {
    let world = World::new();
    world.fs.write_at("a.txt", b"A", 1).await;
    world.fs.write_at("b.txt", b"B", 1).await;

    world.engine.poll(&world.queue).await.unwrap();
    // Both entry() attempts for the first path fail
    world.remote.fail_next(2);
    world.drain().await;

    assert!(world.remote.content("a.txt").is_none());
    assert_eq!(world.remote.content("b.txt").unwrap(), b"B");
    let failures = world.engine.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, "a.txt");

    // The failure log makes the next poll retry it
    world.settle().await;
    assert_eq!(world.remote.content("a.txt").unwrap(), b"A");
    assert!(world.engine.failures().is_empty());
}
