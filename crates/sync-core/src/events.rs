//! Event infrastructure for sync-core.
//!
//! Provides `SyncEvent` for monitoring and `EventBus` for subscriptions.
//! Wrap the bus in `Arc` to share it between the engine and observers.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::types::{Action, ConflictResolution, SyncStatus};

/// Sync events emitted during reconciliation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// An action was applied and committed.
    ActionApplied {
        path: String,
        action: Action,
        status: SyncStatus,
        /// When the commit happened, in milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// Both sides changed; one side's content won.
    ConflictResolved {
        path: String,
        resolution: ConflictResolution,
        action: Action,
        timestamp: u64,
    },
    /// Both sides changed and neither has a usable timestamp.
    /// Local content is retained until resolved by hand.
    ConflictAmbiguous { path: String, timestamp: u64 },
    /// A path could not be synced; it will be retried on the next poll.
    SyncFailed {
        path: String,
        attempts: u32,
        error: String,
        timestamp: u64,
    },
    /// Both sides deleted; metadata dropped.
    Purged { path: String, timestamp: u64 },
    /// A poll cycle finished.
    PollCompleted {
        /// Paths examined
        scanned: usize,
        /// Notices enqueued
        enqueued: usize,
        timestamp: u64,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purged(path: &str) -> SyncEvent {
        SyncEvent::Purged {
            path: path.into(),
            timestamp: 1000,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(purged("a.txt"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(purged("a.txt"));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(purged("b.txt"));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::ActionApplied {
            path: "a.txt".into(),
            action: Action::DeleteRemote,
            status: SyncStatus::LocalAhead,
            timestamp: 1234567890,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"actionApplied\""));
        assert!(json.contains("\"action\":\"deleteRemote\""));
        assert!(json.contains("\"status\":\"localAhead\""));
    }
}
