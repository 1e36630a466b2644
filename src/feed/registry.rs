//! Weakly-held subscriber handles with automatic on-drop unsubscribe
//! (§4.4).
//!
//! Each feed keeps its own per-topic [`crate::feed::signal::TrackableSignal`]
//! tables; this registry is the top-level "every connection the process
//! currently knows about" index used for connection accounting and
//! `server_info`-style liveness reporting, independent of which feeds a
//! given subscriber is on.

use dashmap::DashMap;

use crate::subscriber::{SubscriberHandle, SubscriberId, WeakSubscriber};

#[derive(Default)]
pub struct SubscriberRegistry {
    handles: DashMap<SubscriberId, WeakSubscriber>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) insertion (§4.4).
    pub fn insert(&self, subscriber: &SubscriberHandle) -> SubscriberId {
        let id = SubscriberId::of(subscriber);
        self.handles.insert(id, std::sync::Arc::downgrade(subscriber));
        id
    }

    /// Iterates live subscribers, removing any slot whose weak handle no
    /// longer upgrades. Returns `(pruned, remaining)`.
    pub fn prune_and_count(&self) -> (usize, usize) {
        let dead: Vec<SubscriberId> = self
            .handles
            .iter()
            .filter(|entry| entry.value().upgrade().is_none())
            .map(|entry| *entry.key())
            .collect();
        for id in &dead {
            self.handles.remove(id);
        }
        (dead.len(), self.handles.len())
    }
}
