//! Data model shared by every component of the reconciliation core.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content fingerprint: lowercase hex SHA-256 over the full file bytes.
///
/// Two records hold the same content iff their fingerprints are equal,
/// regardless of timestamp or size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a byte buffer.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed hex digest (e.g. from a remote listing).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// What one side (local or remote) knows about a path.
///
/// A tombstone never carries a fingerprint, and a live record always does.
/// For tombstones `modified_at` is the deletion time, when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the synced root, `/`-separated
    pub path: String,
    /// Content digest (None for tombstones)
    pub fingerprint: Option<Fingerprint>,
    /// Last content change in ms since epoch, on the owning side's clock
    pub modified_at: Option<u64>,
    /// Byte length (diagnostic only)
    pub size: u64,
    /// Record represents a deletion
    pub tombstone: bool,
}

impl FileRecord {
    pub fn live(
        path: impl Into<String>,
        fingerprint: Fingerprint,
        modified_at: Option<u64>,
        size: u64,
    ) -> Self {
        Self {
            path: path.into(),
            fingerprint: Some(fingerprint),
            modified_at,
            size,
            tombstone: false,
        }
    }

    pub fn tombstone(path: impl Into<String>, deleted_at: Option<u64>) -> Self {
        Self {
            path: path.into(),
            fingerprint: None,
            modified_at: deleted_at,
            size: 0,
            tombstone: true,
        }
    }

    /// True when the record describes existing content.
    pub fn is_live(&self) -> bool {
        !self.tombstone && self.fingerprint.is_some()
    }

    /// Fingerprint of live content, None for tombstones.
    pub fn content(&self) -> Option<&Fingerprint> {
        if self.tombstone {
            None
        } else {
            self.fingerprint.as_ref()
        }
    }

    /// Same content as `other` (fingerprint equality only).
    pub fn same_content(&self, other: &FileRecord) -> bool {
        self.content().is_some() && self.content() == other.content()
    }
}

/// Fingerprint of a live record, treating absence and tombstones alike.
pub fn live_content(record: Option<&FileRecord>) -> Option<&Fingerprint> {
    record.and_then(FileRecord::content)
}

/// Last reconciled state of a path on both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub path: String,
    /// Best knowledge of the local filesystem
    pub local: Option<FileRecord>,
    /// Best knowledge of the remote store
    pub remote: Option<FileRecord>,
}

impl SyncState {
    pub fn new(
        path: impl Into<String>,
        local: Option<FileRecord>,
        remote: Option<FileRecord>,
    ) -> Self {
        let path = path.into();
        debug_assert!(local.as_ref().is_none_or(|r| r.path == path));
        debug_assert!(remote.as_ref().is_none_or(|r| r.path == path));
        Self {
            path,
            local,
            remote,
        }
    }

    /// Both sides recorded as deleted (eligible for purge).
    pub fn both_tombstoned(&self) -> bool {
        matches!((&self.local, &self.remote), (Some(l), Some(r)) if l.tombstone && r.tombstone)
    }
}

/// Which signal produced a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeOrigin {
    /// Live filesystem notification
    Watcher,
    /// Periodic full listing diff
    Poll,
}

/// Suspected kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeKind {
    Created,
    Modified,
    Deleted,
}

/// A unit of intake: a suspected change to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub path: String,
    pub origin: NoticeOrigin,
    pub kind: NoticeKind,
    /// When the change was observed, ms since epoch
    pub observed_at: u64,
    /// A `Deleted` notice was coalesced into this one at some point
    pub deletion_seen: bool,
}

impl ChangeNotice {
    pub fn new(path: impl Into<String>, origin: NoticeOrigin, kind: NoticeKind) -> Self {
        Self::at(path, origin, kind, now_millis())
    }

    pub fn at(
        path: impl Into<String>,
        origin: NoticeOrigin,
        kind: NoticeKind,
        observed_at: u64,
    ) -> Self {
        Self {
            path: path.into(),
            origin,
            kind,
            observed_at,
            deletion_seen: kind == NoticeKind::Deleted,
        }
    }

    /// Fold a newer notice for the same path into this one.
    ///
    /// The newest kind is kept. A `Deleted` arriving after anything else
    /// therefore wins, and `deletion_seen` survives a later re-creation.
    pub fn coalesce(&mut self, newer: ChangeNotice) {
        debug_assert_eq!(self.path, newer.path);
        self.deletion_seen |= newer.deletion_seen;
        self.kind = newer.kind;
        self.origin = newer.origin;
        self.observed_at = self.observed_at.max(newer.observed_at);
    }
}

/// Action decided for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    None,
    Upload,
    Download,
    DeleteLocal,
    DeleteRemote,
}

impl Action {
    /// Whether the action moves data or deletes something.
    pub fn is_transfer(self) -> bool {
        !matches!(self, Action::None)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::None => "none",
            Action::Upload => "upload",
            Action::Download => "download",
            Action::DeleteLocal => "delete-local",
            Action::DeleteRemote => "delete-remote",
        };
        f.write_str(name)
    }
}

/// Per-path state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    InSync,
    LocalAhead,
    RemoteAhead,
    Conflict,
    LocalOnly,
    RemoteOnly,
    /// Terminal: both sides deleted, metadata can be purged
    BothDeleted,
}

/// Which side's content survives when both sides changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Side {
    #[default]
    Local,
    Remote,
}

/// Policy for conflicts whose timestamps are exactly equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    #[default]
    PreferLocal,
    PreferRemote,
}

impl TieBreak {
    pub fn winner(self) -> Side {
        match self {
            TieBreak::PreferLocal => Side::Local,
            TieBreak::PreferRemote => Side::Remote,
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Strictly later timestamp won
    NewerWins(Side),
    /// Equal timestamps, settled by the tie-break policy
    TieBreak(Side),
    /// Only one side had a usable timestamp
    OnlyTimestamped(Side),
    /// Neither side had a usable timestamp; local retained, nothing applied
    Ambiguous,
}

impl ConflictResolution {
    pub fn winner(self) -> Option<Side> {
        match self {
            ConflictResolution::NewerWins(side)
            | ConflictResolution::TieBreak(side)
            | ConflictResolution::OnlyTimestamped(side) => Some(side),
            ConflictResolution::Ambiguous => None,
        }
    }
}

/// Outcome of the decision procedure for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub path: String,
    pub status: SyncStatus,
    pub action: Action,
    /// Observed local side
    pub local: Option<FileRecord>,
    /// Observed remote side
    pub remote: Option<FileRecord>,
    /// State to commit when no transfer is needed (convergent edits)
    pub staged: Option<SyncState>,
    /// Set when both sides changed and disagree
    pub conflict: Option<ConflictResolution>,
}

impl Decision {
    /// Plain "nothing to do" (no commit, no purge).
    pub fn is_noop(&self) -> bool {
        self.action == Action::None
            && self.staged.is_none()
            && self.status != SyncStatus::BothDeleted
    }

    pub fn is_ambiguous(&self) -> bool {
        self.conflict == Some(ConflictResolution::Ambiguous)
    }
}

/// Current wall clock in ms since epoch (0 if the clock is before 1970).
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
