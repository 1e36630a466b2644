//! One upstream connection: validated-ledgers subscription, range
//! tracking, gRPC fetch, JSON-RPC forward, liveness signal (§4.1).

pub mod forward;
pub mod grpc;
pub mod state;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    config::SourceConfig,
    error::ClioError,
    metrics::SourceMetrics,
};

pub use grpc::LedgerResponse;
pub use state::{ConnectionState, RangeSnapshot};
use state::SnapshotCell;

/// Backoff floor and ceiling for the reconnect loop (§4.1, §5).
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// No validated-ledger notification within this window triggers `Stalled`
/// (§4.1).
const STALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Notification the LoadBalancer's single consumer loop receives whenever
/// any Source observes a new validated ledger (§9 "Callback-to-balancer").
#[derive(Debug, Clone, Copy)]
pub struct ValidatedLedgerEvent {
    pub source_index: usize,
    pub hi: u32,
}

/// One upstream full-node connection.
pub struct Source {
    pub index: usize,
    config: SourceConfig,
    snapshot: SnapshotCell,
    metrics: SourceMetrics,
    ledger_sink: async_channel::Sender<ValidatedLedgerEvent>,
}

impl Source {
    pub fn new(
        index: usize,
        config: SourceConfig,
        ledger_sink: async_channel::Sender<ValidatedLedgerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            config,
            snapshot: SnapshotCell::default(),
            metrics: SourceMetrics::default(),
            ledger_sink,
        })
    }

    pub fn snapshot(&self) -> RangeSnapshot {
        self.snapshot.read()
    }

    #[cfg(test)]
    pub fn snapshot_for_test(&self, lo: u32, hi: u32, state: ConnectionState) {
        self.snapshot.reset_range(lo, hi);
        self.snapshot.set_state(state);
    }

    pub fn metrics(&self) -> &SourceMetrics {
        &self.metrics
    }

    /// True iff `lo <= seq <= hi` and the Source is currently connected
    /// (§4.1).
    pub fn has_ledger(&self, seq: u32) -> bool {
        self.snapshot.read().has_ledger(seq)
    }

    pub fn is_forwarding(&self) -> bool {
        self.snapshot.read().forwarding
    }

    pub fn set_forwarding(&self, forwarding: bool) {
        self.snapshot.set_forwarding(forwarding);
    }

    /// Spawns the background reconnect-forever loop. Returns once
    /// `shutdown` is cancelled.
    #[instrument(skip_all, fields(source = self.index))]
    pub fn run(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if shutdown.is_cancelled() {
                    self.snapshot.set_state(ConnectionState::Disconnected);
                    return;
                }

                self.snapshot.set_state(ConnectionState::Connecting);
                match self.connect_and_stream(&shutdown).await {
                    Ok(()) => {
                        // Clean shutdown requested mid-stream.
                        self.snapshot.set_state(ConnectionState::Disconnected);
                        return;
                    },
                    Err(e) => {
                        warn!(source = self.index, error = %e, "source disconnected, reconnecting");
                        self.metrics.reconnects.incr();
                        self.snapshot.set_state(ConnectionState::Disconnected);
                    },
                }

                let delay = reconnect_delay(attempt);
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = shutdown.cancelled() => {
                        self.snapshot.set_state(ConnectionState::Disconnected);
                        return;
                    }
                }
            }
        })
    }

    /// Connects, subscribes to `ledgers`/`manifests`/`validations`, and
    /// streams validated-ledger notifications until the connection drops,
    /// stalls, or shutdown is requested. Returns `Ok(())` only on a clean
    /// shutdown; any other termination is an `Err` that the caller
    /// reconnects from.
    async fn connect_and_stream(&self, shutdown: &CancellationToken) -> Result<()> {
        let ws_url = self.config.ws_url()?;
        let (mut stream, _) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect to {ws_url}"))?;

        let subscribe = json!({
            "command": "subscribe",
            "streams": ["ledgers", "manifests", "validations"],
        });
        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send subscribe request")?;
        self.snapshot.set_state(ConnectionState::Subscribed);

        // The subscribe acknowledgement carries the range this source can
        // currently serve (`ledger_index_min`/`ledger_index_max`); seed the
        // range from it rather than leaving `lo` at its zero default (§3,
        // §4.1 "has_ledger" range semantics).
        match tokio::time::timeout(STALL_TIMEOUT, stream.next()).await {
            Ok(Some(frame)) => {
                let frame = frame.context("transport error while awaiting subscribe ack")?;
                if let Message::Text(text) = frame {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        if let Some((lo, hi)) = subscribe_ack_range(&value) {
                            self.snapshot.reset_range(lo, hi);
                        }
                    }
                }
            },
            Ok(None) => anyhow::bail!("upstream closed the stream before acknowledging subscribe"),
            Err(_) => anyhow::bail!("no subscribe acknowledgement within {STALL_TIMEOUT:?}"),
        }

        // Tracks time since the last *validated-ledger* notification, not
        // since the last frame of any kind — a source streaming manifests
        // or validations but no validated ledgers must still stall (§4.1).
        let mut stall_deadline = tokio::time::Instant::now() + STALL_TIMEOUT;

        loop {
            let next = tokio::select! {
                frame = stream.next() => Some(frame),
                _ = tokio::time::sleep_until(stall_deadline) => None,
                _ = shutdown.cancelled() => {
                    let _ = stream.close(None).await;
                    return Ok(());
                }
            };

            let frame = match next {
                Some(Some(frame)) => frame.context("transport error while streaming")?,
                Some(None) => anyhow::bail!("upstream closed the stream"),
                None => {
                    self.snapshot.set_state(ConnectionState::Stalled);
                    self.metrics.stalls.incr();
                    anyhow::bail!("no validated-ledger notification within {STALL_TIMEOUT:?}");
                },
            };

            let Message::Text(text) = frame else { continue };
            let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
            if let Some(ledger_index) = validated_ledger_index(&value) {
                stall_deadline = tokio::time::Instant::now() + STALL_TIMEOUT;
                self.snapshot.set_state(ConnectionState::Streaming);
                self.snapshot.advance_hi(ledger_index);
                self.metrics.last_validated_ledger.set(ledger_index as i64);
                debug!(source = self.index, ledger_index, "validated ledger observed");
                let _ = self
                    .ledger_sink
                    .send(ValidatedLedgerEvent { source_index: self.index, hi: ledger_index })
                    .await;
            }
        }
    }

    /// Single gRPC call for one ledger (§4.1).
    pub async fn fetch_ledger(
        &self,
        seq: u32,
        get_objects: bool,
        get_object_neighbors: bool,
    ) -> Result<LedgerResponse, ClioError> {
        let url = self
            .config
            .grpc_url()
            .map_err(|e| ClioError::Internal(e.to_string()))?;
        let client = grpc::GrpcClient::connect(&url)
            .await
            .map_err(|e| ClioError::Unavailable(e.to_string()))?;
        client.fetch_ledger(seq, get_objects, get_object_neighbors).await
    }

    /// Parallel-marker initial-ledger download (§4.1).
    pub async fn load_initial_ledger(&self, seq: u32, parallel_markers: u16) -> Result<Vec<Vec<u8>>> {
        let url = self.config.grpc_url()?;
        let client = grpc::GrpcClient::connect(&url).await?;
        client.load_initial_ledger(seq, parallel_markers).await
    }

    /// JSON-RPC forward over WebSocket (§4.1).
    pub async fn forward(
        &self,
        request: &Value,
        client_ip: &str,
        x_user: &str,
    ) -> Result<Value, ClioError> {
        let url = self
            .config
            .ws_url()
            .map_err(|e| ClioError::Internal(e.to_string()))?;
        forward::forward(&url, request, client_ip, x_user).await
    }
}

fn validated_ledger_index(value: &Value) -> Option<u32> {
    if value.get("type")?.as_str()? != "ledgerClosed" {
        return None;
    }
    value
        .get("ledger_index")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
}

/// Extracts `(ledger_index_min, ledger_index_max)` from a `subscribe`
/// response, the range this source can currently serve.
fn subscribe_ack_range(value: &Value) -> Option<(u32, u32)> {
    let result = value.get("result")?;
    let lo = result.get("ledger_index_min").and_then(Value::as_i64)?;
    let hi = result.get("ledger_index_max").and_then(Value::as_i64)?;
    if lo < 0 || hi < 0 {
        return None;
    }
    Some((lo as u32, hi as u32))
}

/// `delay = base * 2^attempt` clamped to `[1s, 30s]`, jittered by a
/// uniform factor in `[0.8, 1.2]` (the stated ±20%; see `DESIGN.md`'s
/// resolution of the exact-formula Open Question).
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let clamped = exp.clamp(BACKOFF_BASE, BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    clamped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_is_clamped() {
        for attempt in 0..20 {
            let delay = reconnect_delay(attempt);
            assert!(delay >= BACKOFF_BASE.mul_f64(0.8));
            assert!(delay <= BACKOFF_CAP.mul_f64(1.2));
        }
    }

    #[test]
    fn validated_ledger_index_parses_ledger_closed() {
        let value = json!({"type": "ledgerClosed", "ledger_index": 42});
        assert_eq!(validated_ledger_index(&value), Some(42));
        assert_eq!(validated_ledger_index(&json!({"type": "other"})), None);
    }

    #[test]
    fn subscribe_ack_range_parses_min_and_max() {
        let value = json!({"result": {"ledger_index_min": 10, "ledger_index_max": 20}});
        assert_eq!(subscribe_ack_range(&value), Some((10, 20)));
    }

    #[test]
    fn subscribe_ack_range_rejects_negative_min() {
        let value = json!({"result": {"ledger_index_min": -1, "ledger_index_max": 20}});
        assert_eq!(subscribe_ack_range(&value), None);
    }

    #[test]
    fn subscribe_ack_range_none_when_fields_missing() {
        assert_eq!(subscribe_ack_range(&json!({"result": {}})), None);
    }
}
