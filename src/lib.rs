//! A validated-ledger indexer and read-replica: extracts ledger data from
//! a pool of upstream full nodes, persists it via the [`backend`]
//! collaborator, forwards non-indexable requests upstream, and
//! multiplexes real-time event feeds to subscribed clients (see
//! `SPEC_FULL.md`).
//!
//! The two components that own concurrency, failure recovery, and
//! lifetime management are [`load_balancer::LoadBalancer`] (the ETL load
//! balancer) and [`feed::FeedEngine`] (the subscription feed engine).
//! Everything else in this crate is a thin collaborator around them.

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod load_balancer;
pub mod metrics;
pub mod source;
pub mod subscriber;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use backend::Backend;
use config::Config;
use dispatch::CommandTable;
use feed::FeedEngine;
use load_balancer::{ForwardingCache, LoadBalancer};
use metrics::CoreMetrics;
use source::{Source, ValidatedLedgerEvent};

/// Everything a running process needs to dispatch requests: the load
/// balancer, the feed engine, the command table, and the storage
/// collaborator, plus the shutdown flag every background loop observes
/// (§5 "Cancellation").
pub struct App {
    pub load_balancer: Arc<LoadBalancer>,
    pub feed: Arc<FeedEngine>,
    pub table: Arc<CommandTable>,
    pub backend: Arc<dyn Backend>,
    pub shutdown: CancellationToken,
}

impl App {
    /// Builds every `Source` from `config`, wires the validated-ledger
    /// event channel into a fresh `LoadBalancer`, and starts all
    /// background loops (§9 "Callback-to-balancer from Source").
    pub fn start(config: &Config, backend: Arc<dyn Backend>) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let (ledger_tx, ledger_rx) = async_channel::unbounded::<ValidatedLedgerEvent>();

        let sources: Vec<Arc<Source>> = config
            .sources
            .iter()
            .enumerate()
            .map(|(index, source_config)| Source::new(index, source_config.clone(), ledger_tx.clone()))
            .collect();

        let cache = config.forwarding.cache_timeout.map(ForwardingCache::new);
        let metrics = Arc::new(CoreMetrics::default());
        let load_balancer = LoadBalancer::new(sources, cache, metrics.clone(), shutdown.clone());
        load_balancer.start(ledger_rx);

        Arc::new(Self {
            load_balancer,
            feed: Arc::new(FeedEngine::new(metrics)),
            table: Arc::new(CommandTable::build()),
            backend,
            shutdown,
        })
    }

    /// Observed by every retry loop at its next sleep or suspension point
    /// (§5 "Cancellation").
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Per-source connectivity/range from the load balancer, plus the
    /// locally-indexed range reported by the storage collaborator (§4.3
    /// `toJson`, extended with the backend's own range).
    pub async fn status(&self) -> Result<serde_json::Value> {
        let indexed_range = self
            .backend
            .indexed_range()
            .await
            .context("failed to read indexed range from storage backend")?;
        let mut value = self.load_balancer.to_json();
        value["indexed_range"] = json!(indexed_range);
        Ok(value)
    }
}

/// Reads and validates the TOML configuration document at `path` (§6.1).
pub fn load_config(path: &std::path::Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load config from {}", path.display()))
}

/// Installs the `tracing-subscriber` formatter selected by `--log-format`,
/// filtered by `--log-level`/`RUST_LOG` (§1.1 ambient stack).
pub fn init_tracing(log_level: &str, format: config::LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        config::LogFormat::Compact => subscriber.compact().init(),
        config::LogFormat::Json => subscriber.json().init(),
    }
}
