//! IntakeQueue: the single entry point for change notices.
//!
//! Watcher events and poll diffs both land here. The queue:
//! - coalesces notices per path (newest kind wins, `Deleted` precedence kept),
//! - hands out at most one notice per path at a time (per-path serialization),
//! - holds notices for an in-flight path until `complete` is called,
//! - applies backpressure instead of dropping when `capacity` distinct paths
//!   are pending.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

use crate::types::ChangeNotice;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("Intake queue is closed")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    /// Paths in arrival order (may include in-flight paths waiting for completion)
    order: VecDeque<String>,
    /// Coalesced notice per pending path
    pending: HashMap<String, ChangeNotice>,
    /// Paths currently being processed by a worker
    in_flight: HashSet<String>,
    closed: bool,
}

pub struct IntakeQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when a notice becomes available or the queue closes
    ready: Notify,
    /// Signalled when pending space frees up or the queue closes
    space: Notify,
}

impl IntakeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    /// Enqueue a notice, waiting for space if the queue is full.
    pub async fn push(&self, notice: ChangeNotice) -> Result<(), QueueError> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            // Register before checking so a release between check and await is not lost
            space.as_mut().enable();

            match self.try_push_inner(notice.clone()) {
                Ok(true) => return Ok(()),
                Ok(false) => space.await,
                Err(e) => return Err(e),
            }
        }
    }

    /// Enqueue without waiting. Returns false when the queue is full and
    /// the path is not already pending.
    pub fn try_push(&self, notice: ChangeNotice) -> Result<bool, QueueError> {
        self.try_push_inner(notice)
    }

    fn try_push_inner(&self, notice: ChangeNotice) -> Result<bool, QueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }

        if let Some(existing) = state.pending.get_mut(&notice.path) {
            trace!(path = %notice.path, kind = ?notice.kind, "coalescing notice");
            existing.coalesce(notice);
            return Ok(true);
        }

        if state.pending.len() >= self.capacity {
            return Ok(false);
        }

        let runnable = !state.in_flight.contains(&notice.path);
        state.order.push_back(notice.path.clone());
        state.pending.insert(notice.path.clone(), notice);
        drop(state);

        if runnable {
            self.ready.notify_one();
        }
        Ok(true)
    }

    /// Take the next runnable notice, marking its path in flight.
    ///
    /// Returns None once the queue is closed.
    pub async fn next(&self) -> Option<ChangeNotice> {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(notice) = Self::take_runnable(&mut state) {
                    let more = state
                        .order
                        .iter()
                        .any(|p| !state.in_flight.contains(p));
                    drop(state);
                    self.space.notify_one();
                    if more {
                        // Let another worker pick up the rest
                        self.ready.notify_one();
                    }
                    return Some(notice);
                }
            }

            ready.await;
        }
    }

    fn take_runnable(state: &mut QueueState) -> Option<ChangeNotice> {
        let index = state
            .order
            .iter()
            .position(|p| !state.in_flight.contains(p))?;
        let path = state.order.remove(index)?;
        let notice = state.pending.remove(&path)?;
        state.in_flight.insert(path);
        Some(notice)
    }

    /// Mark a path as done. Any notice that arrived meanwhile becomes runnable.
    pub fn complete(&self, path: &str) {
        let mut state = self.lock();
        state.in_flight.remove(path);
        let waiting = state.pending.contains_key(path);
        drop(state);
        if waiting {
            self.ready.notify_one();
        }
    }

    /// Stop accepting notices and wake every waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of distinct pending paths (excluding in-flight ones without a newer notice).
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
