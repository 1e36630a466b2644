//! `TrackableSignal` and `TrackableSignalMap`: the typed fan-out primitive
//! key-scoped subscription tables are built from (§4.5).

use std::hash::Hash;

use dashmap::DashMap;

use crate::{
    metrics::Gauge,
    subscriber::{SubscriberHandle, SubscriberId, WeakSubscriber},
};

/// A single topic's subscription table: subscriber identity → weak
/// handle. `connect`/`disconnect` are idempotent; `emit` prunes dead slots
/// after one full traversal (§4.5 invariant: "after any emit, no dead
/// slots remain").
#[derive(Default)]
pub struct TrackableSignal {
    slots: DashMap<SubscriberId, WeakSubscriber>,
    gauge: Gauge,
}

impl TrackableSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: a second connect from the same subscriber is a no-op
    /// returning the existing slot id.
    pub fn connect(&self, subscriber: &SubscriberHandle) -> SubscriberId {
        let id = SubscriberId::of(subscriber);
        if let dashmap::mapref::entry::Entry::Vacant(entry) = self.slots.entry(id) {
            entry.insert(std::sync::Arc::downgrade(subscriber));
            self.gauge.incr();
        }
        id
    }

    /// Removes the slot if present; returns whether it was present.
    pub fn disconnect(&self, subscriber: &SubscriberHandle) -> bool {
        self.disconnect_id(SubscriberId::of(subscriber))
    }

    pub fn disconnect_id(&self, id: SubscriberId) -> bool {
        let removed = self.slots.remove(&id).is_some();
        if removed {
            self.gauge.decr();
        }
        removed
    }

    /// For each live slot, invokes `deliver`, which returns whether the
    /// subscriber should remain connected (`false` on a failed send). Dead
    /// slots (expired weak handles) and slots whose delivery failed are
    /// queued and removed once the traversal completes. Delivery order is
    /// unspecified but stable for the duration of this call, matching the
    /// language-neutral contract in §4.5.
    pub fn emit(&self, mut deliver: impl FnMut(SubscriberId, &SubscriberHandle) -> bool) {
        let mut dead = Vec::new();
        for entry in self.slots.iter() {
            match entry.value().upgrade() {
                Some(strong) => {
                    if !deliver(*entry.key(), &strong) {
                        dead.push(*entry.key());
                    }
                },
                None => dead.push(*entry.key()),
            }
        }
        for id in dead {
            self.disconnect_id(id);
        }
    }

    pub fn count(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.slots.contains_key(&id)
    }
}

/// Key-scoped variant: the same API parameterized by `Key`
/// (per-account/per-book filters). `count()` is the number of
/// *subscriptions* (summed over keys), not of unique subscribers (§4.5).
#[derive(Default)]
pub struct TrackableSignalMap<Key: Eq + Hash + Clone> {
    tables: DashMap<Key, TrackableSignal>,
}

impl<Key: Eq + Hash + Clone> TrackableSignalMap<Key> {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
        }
    }

    pub fn connect(&self, key: Key, subscriber: &SubscriberHandle) -> SubscriberId {
        self.tables.entry(key).or_default().connect(subscriber)
    }

    pub fn disconnect(&self, key: &Key, subscriber: &SubscriberHandle) -> bool {
        match self.tables.get(key) {
            Some(signal) => signal.disconnect(subscriber),
            None => false,
        }
    }

    /// Emits on the signal for `key` only, if it exists. Feeds call this
    /// once per relevant key derived from the published event.
    pub fn emit(&self, key: &Key, deliver: impl FnMut(SubscriberId, &SubscriberHandle) -> bool) {
        if let Some(signal) = self.tables.get(key) {
            signal.emit(deliver);
        }
    }

    pub fn count(&self) -> u64 {
        self.tables.iter().map(|entry| entry.value().count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::ApiVersion;
    use std::sync::{Arc, Mutex};

    struct TestSink {
        received: Mutex<Vec<String>>,
    }

    impl crate::subscriber::SubscriberSink for TestSink {
        fn send(&self, message: Arc<str>) -> anyhow::Result<()> {
            self.received.lock().unwrap().push(message.to_string());
            Ok(())
        }

        fn api_version(&self) -> ApiVersion {
            ApiVersion::V1
        }
    }

    fn sink() -> Arc<TestSink> {
        Arc::new(TestSink {
            received: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn connect_is_idempotent() {
        let signal = TrackableSignal::new();
        let sub: SubscriberHandle = sink();
        let first = signal.connect(&sub);
        let second = signal.connect(&sub);
        assert_eq!(first, second);
        assert_eq!(signal.count(), 1);
    }

    #[test]
    fn disconnect_then_emit_delivers_nothing() {
        let signal = TrackableSignal::new();
        let sub: SubscriberHandle = sink();
        signal.connect(&sub);
        assert!(signal.disconnect(&sub));
        assert_eq!(signal.count(), 0);

        let mut delivered = 0;
        signal.emit(|_, _| {
            delivered += 1;
            true
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn emit_prunes_dead_subscribers() {
        let signal = TrackableSignal::new();
        {
            let sub: SubscriberHandle = sink();
            signal.connect(&sub);
        } // strong ref dropped here
        assert_eq!(signal.count(), 1, "slot not yet pruned");

        let mut delivered = 0;
        signal.emit(|_, _| {
            delivered += 1;
            true
        });
        assert_eq!(delivered, 0);
        assert_eq!(signal.count(), 0, "dead slot pruned after emit");
    }

    #[test]
    fn emit_prunes_slot_whose_delivery_reports_failure() {
        let signal = TrackableSignal::new();
        let sub: SubscriberHandle = sink();
        signal.connect(&sub);
        assert_eq!(signal.count(), 1);

        signal.emit(|_, _| false);
        assert_eq!(signal.count(), 0, "slot pruned after a failed delivery");
    }

    #[test]
    fn signal_map_counts_subscriptions_not_subscribers() {
        let map: TrackableSignalMap<String> = TrackableSignalMap::new();
        let sub: SubscriberHandle = sink();
        map.connect("acct1".to_string(), &sub);
        map.connect("acct2".to_string(), &sub);
        assert_eq!(map.count(), 2);
    }
}
