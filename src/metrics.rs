//! A lightweight observability surface threaded through `Source`,
//! `LoadBalancer` and the feed engines.
//!
//! The spec treats metric plumbing as an external collaborator with a
//! stated interface only, so this stays a small struct of atomics rather
//! than wiring up a Prometheus exporter; values are also emitted as
//! `tracing` fields at the call sites that mutate them, matching how the
//! L1 client in this codebase logs `head`/`finalized`/`reconnects` gauges
//! alongside updating them.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-Source counters, owned by the `LoadBalancer` and indexed by source
/// position.
#[derive(Debug, Default)]
pub struct SourceMetrics {
    pub reconnects: Counter,
    pub stalls: Counter,
    pub last_validated_ledger: Gauge,
}

/// Process-wide counters for the feed engines and forwarding cache.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    pub forwarding_cache_hits: Counter,
    pub forwarding_cache_misses: Counter,
    pub forward_fallbacks: Counter,
    pub subscribers_pruned: Counter,
}
