//! Owns all Sources; routes fetches and forwards; picks one *forwarding
//! source* at a time; manages the retry loop (§4.3).

pub mod cache;

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    error::{ClioError, ForwardingFailure},
    metrics::CoreMetrics,
    source::{LedgerResponse, Source, ValidatedLedgerEvent},
};

pub use cache::ForwardingCache;

/// Upstream-advertised chain parameters, captured from whichever Source
/// first reports them (§3 "LoadBalancer").
#[derive(Debug, Clone)]
pub struct EtlState {
    pub network_id: u32,
    pub base_fee: u64,
    pub reserve_base: u64,
}

struct ForwardingState {
    /// Index into `sources` of the currently designated forwarder, if any.
    current: parking_lot::RwLock<Option<usize>>,
}

pub struct LoadBalancer {
    sources: Vec<Arc<Source>>,
    cache: Option<ForwardingCache>,
    etl_state: parking_lot::RwLock<Option<EtlState>>,
    forwarding: ForwardingState,
    metrics: Arc<CoreMetrics>,
    shutdown: CancellationToken,
}

impl LoadBalancer {
    /// `metrics` is shared with the [`crate::feed::FeedEngine`] so both
    /// collaborators account into the same process-wide counters.
    pub fn new(
        sources: Vec<Arc<Source>>,
        cache: Option<ForwardingCache>,
        metrics: Arc<CoreMetrics>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sources,
            cache,
            etl_state: parking_lot::RwLock::new(None),
            forwarding: ForwardingState {
                current: parking_lot::RwLock::new(None),
            },
            metrics,
            shutdown,
        })
    }

    pub fn metrics(&self) -> &CoreMetrics {
        &self.metrics
    }

    pub fn sources(&self) -> &[Arc<Source>] {
        &self.sources
    }

    /// Starts every Source's background loop and the single consumer loop
    /// that reacts to validated-ledger events by re-evaluating the
    /// forwarding source (§9 "Callback-to-balancer from Source").
    pub fn start(self: &Arc<Self>, ledger_events: async_channel::Receiver<ValidatedLedgerEvent>) {
        for source in &self.sources {
            source.clone().run(self.shutdown.clone());
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = ledger_events.recv() => {
                        match event {
                            Ok(event) => this.on_validated_ledger(event),
                            Err(_) => return,
                        }
                    }
                    _ = this.shutdown.cancelled() => return,
                }
            }
        });

        // Initial election: (a) "initial setup completes" (§4.3).
        self.choose_forwarding_source();
    }

    fn on_validated_ledger(&self, event: ValidatedLedgerEvent) {
        if let Some(cache) = &self.cache {
            cache.invalidate(event.hi);
        }
        // (b)/(c): a source's connectivity may have just changed.
        self.choose_forwarding_source();
    }

    /// Sets the cached ETL-state snapshot if none has been captured yet
    /// (§3: "captured from whichever Source first reports it").
    pub fn set_etl_state_if_absent(&self, state: EtlState) {
        let mut guard = self.etl_state.write();
        if guard.is_none() {
            *guard = Some(state);
        }
    }

    pub fn get_etl_state(&self) -> Option<EtlState> {
        self.etl_state.read().clone()
    }

    /// First connected Source in configured order becomes the forwarder;
    /// ties broken by order. The old forwarder's bit is cleared before the
    /// new one's is set, preserving "at most one forwarder at a time"
    /// (§8, invariant 1).
    fn choose_forwarding_source(&self) {
        let elected = self
            .sources
            .iter()
            .position(|s| s.snapshot().connected());

        let mut current = self.forwarding.current.write();
        if *current == elected {
            return;
        }
        if let Some(old) = *current {
            self.sources[old].set_forwarding(false);
        }
        if let Some(new) = elected {
            self.sources[new].set_forwarding(true);
            info!(source = new, "elected new forwarding source");
        } else {
            warn!("no connected source available to forward to");
        }
        *current = elected;
    }

    fn has_forwarding_source(&self) -> bool {
        self.forwarding.current.read().is_some()
    }

    /// Runs `f` against sources eligible for `seq`, retrying forever until
    /// one returns `Some`, or until shutdown (§4.3 `execute`).
    async fn execute<R, F, Fut>(&self, seq: u32, retry_after: Duration, f: F) -> Result<R, ClioError>
    where
        F: Fn(Arc<Source>) -> Fut,
        Fut: Future<Output = Option<R>>,
    {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(ClioError::Shutdown);
            }

            let mut eligible: Vec<Arc<Source>> =
                self.sources.iter().filter(|s| s.has_ledger(seq)).cloned().collect();

            if eligible.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(retry_after) => continue,
                    _ = self.shutdown.cancelled() => return Err(ClioError::Shutdown),
                }
            }

            eligible.shuffle(&mut rand::thread_rng());
            for source in eligible {
                if let Some(result) = f(source).await {
                    return Ok(result);
                }
            }
            // Exhausted without success; re-snapshot and try again (§4.3 step 4).
        }
    }

    /// Retries forever until success or shutdown (§4.3).
    pub async fn load_initial_ledger(
        &self,
        seq: u32,
        num_markers: u16,
        retry_after: Duration,
    ) -> Result<Vec<Vec<u8>>, ClioError> {
        self.execute(seq, retry_after, |source| async move {
            source.load_initial_ledger(seq, num_markers).await.ok()
        })
        .await
    }

    /// Returns `Ok(None)` when the storage collaborator reports the
    /// ledger is already indexed locally, or when shutdown fires mid-call
    /// (§4.3). Otherwise retries forever across eligible sources.
    pub async fn fetch_ledger(
        &self,
        seq: u32,
        backend: &dyn crate::backend::Backend,
        get_objects: bool,
        get_object_neighbors: bool,
        retry_after: Duration,
    ) -> Result<Option<LedgerResponse>, ClioError> {
        if backend
            .is_ledger_indexed(seq)
            .await
            .map_err(ClioError::internal)?
        {
            return Ok(None);
        }

        match self
            .execute(seq, retry_after, |source| async move {
                match source.fetch_ledger(seq, get_objects, get_object_neighbors).await {
                    Ok(response) => Some(response),
                    Err(ClioError::NotFound) | Err(ClioError::Unavailable(_)) => None,
                    Err(_) => None,
                }
            })
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(ClioError::Shutdown) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Consults the forwarding cache; on miss, invokes the designated
    /// forwarding Source; on transport failure, falls back to a random
    /// other connected Source, up to `N` attempts (`N` = number of
    /// sources) (§4.3).
    pub async fn forward_to_rippled(
        &self,
        request: &Value,
        client_ip: &str,
        is_admin: bool,
    ) -> Result<Value, ClioError> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(request) {
                self.metrics.forwarding_cache_hits.incr();
                return Ok(cached);
            }
            self.metrics.forwarding_cache_misses.incr();
        }

        let x_user = if is_admin { "clio_admin" } else { "clio_user" };

        let mut attempted: Vec<usize> = Vec::new();
        let designated = *self.forwarding.current.read();
        let mut candidate = designated;

        loop {
            let Some(index) = candidate else {
                return Err(ClioError::ForwardingFailed(if attempted.is_empty() {
                    ForwardingFailure::NoSources
                } else {
                    ForwardingFailure::AllAttemptsFailed
                }));
            };

            attempted.push(index);
            let source = self.sources[index].clone();
            match source.forward(request, client_ip, x_user).await {
                Ok(response) => {
                    if let Some(cache) = &self.cache {
                        cache.put(request, response.clone());
                    }
                    return Ok(response);
                },
                Err(e) => {
                    warn!(source = index, error = %e, "forward attempt failed, trying fallback");
                    self.metrics.forward_fallbacks.incr();
                },
            }

            if attempted.len() >= self.sources.len() {
                return Err(ClioError::ForwardingFailed(ForwardingFailure::AllAttemptsFailed));
            }

            candidate = self
                .sources
                .iter()
                .enumerate()
                .filter(|(i, s)| !attempted.contains(i) && s.snapshot().connected())
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
                .choose(&mut rand::thread_rng())
                .copied();
        }
    }

    pub fn has_forwarding_source_flag(&self) -> bool {
        self.has_forwarding_source()
    }

    /// Per-source liveness, range, and forwarding flag (§4.3 `toJson`).
    pub fn to_json(&self) -> Value {
        let sources: Vec<Value> = self
            .sources
            .iter()
            .map(|s| {
                let snap = s.snapshot();
                json!({
                    "index": s.index,
                    "connected": snap.connected(),
                    "range": [snap.lo, snap.hi],
                    "forwarding": snap.forwarding,
                })
            })
            .collect();
        json!({ "sources": sources, "has_forwarding_source": self.has_forwarding_source() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_source(index: usize, lo: u32, hi: u32, state: crate::source::ConnectionState) -> Arc<Source> {
        let (tx, _rx) = async_channel::unbounded();
        let config = crate::config::SourceConfig {
            ip: "127.0.0.1".into(),
            ws_port: 0,
            grpc_port: 0,
        };
        let source = Source::new(index, config, tx);
        source.snapshot_for_test(lo, hi, state);
        source
    }

    #[tokio::test]
    async fn choose_forwarding_source_picks_first_connected_in_order() {
        let a = make_source(0, 1, 10, crate::source::ConnectionState::Disconnected);
        let b = make_source(1, 1, 10, crate::source::ConnectionState::Streaming);
        let c = make_source(2, 1, 10, crate::source::ConnectionState::Streaming);
        let lb = LoadBalancer::new(
            vec![a.clone(), b.clone(), c.clone()],
            None,
            Arc::new(CoreMetrics::default()),
            CancellationToken::new(),
        );
        lb.choose_forwarding_source();
        assert!(!a.is_forwarding());
        assert!(b.is_forwarding());
        assert!(!c.is_forwarding());
    }

    #[tokio::test]
    async fn to_json_reports_per_source_state() {
        let a = make_source(0, 1, 10, crate::source::ConnectionState::Streaming);
        let lb = LoadBalancer::new(vec![a], None, Arc::new(CoreMetrics::default()), CancellationToken::new());
        let value = lb.to_json();
        assert!(value["sources"][0]["connected"].as_bool().unwrap());
    }
}
