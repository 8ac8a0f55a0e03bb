//! Decision procedure: given the last reconciled state of a path and what
//! each side looks like now, decide what (if anything) to transfer.
//!
//! The procedure is a pure function. Feeding it the state it just produced
//! (after the executor committed it) always yields `InSync` with no action,
//! which is what makes duplicate or late notices harmless.
//!
//! Change detection compares fingerprints only. A touched file with
//! identical content is unchanged.

use std::cmp::Ordering;

use crate::types::{
    Action, ConflictResolution, Decision, FileRecord, Side, SyncState, SyncStatus, TieBreak,
    live_content,
};

/// Decide the action for one path.
///
/// `local` and `remote` are the current observations: a live record, a
/// tombstone, or None when that side never had the path.
pub fn decide(
    path: &str,
    previous: Option<&SyncState>,
    local: Option<FileRecord>,
    remote: Option<FileRecord>,
    tie_break: TieBreak,
) -> Decision {
    let prev_local = previous.and_then(|s| s.local.as_ref());
    let prev_remote = previous.and_then(|s| s.remote.as_ref());

    let local_live = live_content(local.as_ref()).is_some();
    let remote_live = live_content(remote.as_ref()).is_some();

    let mut decision = Decision {
        path: path.to_string(),
        status: SyncStatus::InSync,
        action: Action::None,
        local,
        remote,
        staged: None,
        conflict: None,
    };

    if !local_live && !remote_live {
        decision.status = SyncStatus::BothDeleted;
        return decision;
    }

    // Without a previous state any observed record, tombstones included,
    // counts as a change. A side with no record at all stays unchanged.
    let changed = |now: Option<&FileRecord>, before: Option<&FileRecord>| match previous {
        None => now.is_some(),
        Some(_) => live_content(now) != live_content(before),
    };
    let local_changed = changed(decision.local.as_ref(), prev_local);
    let remote_changed = changed(decision.remote.as_ref(), prev_remote);

    match (local_changed, remote_changed) {
        (false, false) => {}
        (true, false) => push_local(&mut decision, remote_live),
        (false, true) => push_remote(&mut decision, local_live),
        (true, true) => {
            let same = live_content(decision.local.as_ref()).is_some()
                && live_content(decision.local.as_ref()) == live_content(decision.remote.as_ref());
            if same {
                // Independent convergent edits: record, transfer nothing
                decision.staged = Some(SyncState::new(
                    path,
                    decision.local.clone(),
                    decision.remote.clone(),
                ));
            } else {
                resolve_conflict(&mut decision, tie_break, local_live, remote_live);
            }
        }
    }

    decision
}

fn push_local(decision: &mut Decision, remote_live: bool) {
    if live_content(decision.local.as_ref()).is_some() {
        decision.action = Action::Upload;
        decision.status = if remote_live {
            SyncStatus::LocalAhead
        } else {
            SyncStatus::LocalOnly
        };
    } else {
        decision.action = Action::DeleteRemote;
        decision.status = SyncStatus::LocalAhead;
    }
}

fn push_remote(decision: &mut Decision, local_live: bool) {
    if live_content(decision.remote.as_ref()).is_some() {
        decision.action = Action::Download;
        decision.status = if local_live {
            SyncStatus::RemoteAhead
        } else {
            SyncStatus::RemoteOnly
        };
    } else {
        decision.action = Action::DeleteLocal;
        decision.status = SyncStatus::RemoteAhead;
    }
}

fn resolve_conflict(decision: &mut Decision, tie_break: TieBreak, local_live: bool, remote_live: bool) {
    decision.status = SyncStatus::Conflict;

    let local_ts = decision.local.as_ref().and_then(|r| r.modified_at);
    let remote_ts = decision.remote.as_ref().and_then(|r| r.modified_at);

    let resolution = match (local_ts, remote_ts) {
        (Some(l), Some(r)) => match l.cmp(&r) {
            Ordering::Greater => ConflictResolution::NewerWins(Side::Local),
            Ordering::Less => ConflictResolution::NewerWins(Side::Remote),
            Ordering::Equal => ConflictResolution::TieBreak(tie_break.winner()),
        },
        (Some(_), None) => ConflictResolution::OnlyTimestamped(Side::Local),
        (None, Some(_)) => ConflictResolution::OnlyTimestamped(Side::Remote),
        (None, None) => ConflictResolution::Ambiguous,
    };
    decision.conflict = Some(resolution);

    decision.action = match resolution.winner() {
        Some(Side::Local) if local_live => Action::Upload,
        Some(Side::Local) => Action::DeleteRemote,
        Some(Side::Remote) if remote_live => Action::Download,
        Some(Side::Remote) => Action::DeleteLocal,
        // Keep local content in place until someone settles it
        None => Action::None,
    };
}
