//! sync-core: Reconciliation engine for keeping a local folder and a remote
//! store consistent.
//!
//! This crate provides:
//! - The data model (`FileRecord`, `SyncState`, `ChangeNotice`, `Decision`)
//! - A pure decision procedure (`reconcile::decide`)
//! - `HashIndex` and `MetadataStore` for fingerprints and reconciled state
//! - `IntakeQueue`, `ReconciliationEngine` and `ActionExecutor`
//! - FileSystem and RemoteStore trait abstractions with in-memory doubles

pub mod engine;
pub mod events;
pub mod executor;
pub mod fs;
pub mod hash_index;
pub mod ignore;
pub mod metadata;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod types;

pub use engine::{EngineConfig, EngineError, Outcome, PollReport, ReconciliationEngine, SyncFailure};
pub use events::{EventBus, Subscription, SyncEvent};
pub use executor::{ActionExecutor, Applied, ExecError};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use hash_index::{HashIndex, HashIndexError};
pub use ignore::IgnoreRules;
pub use metadata::{MetadataError, MetadataStore, PathGuard};
pub use queue::{IntakeQueue, QueueError};
pub use reconcile::decide;
pub use remote::{Download, FileList, InMemoryRemote, RemoteEntry, RemoteError, RemoteStore};
pub use retry::RetryConfig;
pub use types::{
    Action, ChangeNotice, ConflictResolution, Decision, FileRecord, Fingerprint, NoticeKind,
    NoticeOrigin, Side, SyncState, SyncStatus, TieBreak,
};
