//! Configuration loading: a TOML document (`etl_sources`, `forwarding`,
//! `api_version`) layered with CLI/env overrides, mirroring the
//! `clap(derive, env)` + `serde`/`toml` pattern this codebase uses for its
//! process options.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use url::Url;

/// One upstream full node this process may extract from or forward to.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub ip: String,
    pub ws_port: u16,
    pub grpc_port: u16,
}

impl SourceConfig {
    pub fn grpc_url(&self) -> Result<Url> {
        Url::parse(&format!("http://{}:{}", self.ip, self.grpc_port))
            .with_context(|| format!("invalid grpc address for source {}", self.ip))
    }

    pub fn ws_url(&self) -> Result<Url> {
        Url::parse(&format!("ws://{}:{}", self.ip, self.ws_port))
            .with_context(|| format!("invalid ws address for source {}", self.ip))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ForwardingConfigRaw {
    #[serde(default)]
    cache_timeout: u64,
}

/// Validated forwarding-cache configuration. `cache_timeout == 0` disables
/// the cache entirely.
#[derive(Debug, Clone)]
pub struct ForwardingConfig {
    pub cache_timeout: Option<Duration>,
}

impl From<ForwardingConfigRaw> for ForwardingConfig {
    fn from(raw: ForwardingConfigRaw) -> Self {
        Self {
            cache_timeout: (raw.cache_timeout > 0).then(|| Duration::from_secs(raw.cache_timeout)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiVersionConfig {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for ApiVersionConfig {
    fn default() -> Self {
        Self {
            default: 1,
            min: 1,
            max: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    etl_sources: Vec<SourceConfig>,
    #[serde(default)]
    forwarding: ForwardingConfigRaw,
    #[serde(default)]
    num_markers: Option<u16>,
    #[serde(default)]
    api_version: Option<ApiVersionConfig>,
}

impl Default for ForwardingConfigRaw {
    fn default() -> Self {
        Self { cache_timeout: 0 }
    }
}

/// The validated, in-memory configuration the rest of the crate depends on.
#[derive(Debug, Clone)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    pub forwarding: ForwardingConfig,
    /// Initial-ledger download parallelism, clamped to `[1, 256]`.
    pub num_markers: u16,
    pub api_version: ApiVersionConfig,
}

/// Parallel-marker count is clamped to `[1, 256]` per §4.3's edge cases.
const NUM_MARKERS_DEFAULT: u16 = 16;
const NUM_MARKERS_MIN: u16 = 1;
const NUM_MARKERS_MAX: u16 = 256;

impl Config {
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let raw: ConfigDocument =
            toml::from_str(document).context("failed to parse configuration document")?;
        anyhow::ensure!(!raw.etl_sources.is_empty(), "at least one etl_source is required");

        let num_markers = raw
            .num_markers
            .unwrap_or(NUM_MARKERS_DEFAULT)
            .clamp(NUM_MARKERS_MIN, NUM_MARKERS_MAX);

        Ok(Self {
            sources: raw.etl_sources,
            forwarding: raw.forwarding.into(),
            num_markers,
            api_version: raw.api_version.unwrap_or_default(),
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let document = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&document)
    }
}

/// CLI entry point options, layered over the TOML document the same way
/// process-level flags override structured config elsewhere in this
/// codebase: `clap(derive, env)` for anything that makes sense as a flag,
/// `serde`/`toml` for the structured document.
#[derive(Debug, Parser)]
#[command(name = "clio", about = "Validated-ledger indexer and read-replica")]
pub struct Options {
    /// Path to the TOML configuration document.
    #[arg(long, env = "CLIO_CONFIG")]
    pub config: PathBuf,

    /// Downstream JSON-RPC/WebSocket listen address.
    #[arg(long, env = "CLIO_BIND", default_value = "0.0.0.0:6006")]
    pub bind: String,

    /// `tracing-subscriber` output format.
    #[arg(long, env = "CLIO_LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// `RUST_LOG`-style filter string, forwarded to `EnvFilter`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogFormat {
    Compact,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let doc = r#"
            [[etl_sources]]
            ip = "127.0.0.1"
            ws_port = 6005
            grpc_port = 50051

            [forwarding]
            cache_timeout = 5
        "#;
        let config = Config::from_toml_str(doc).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.num_markers, NUM_MARKERS_DEFAULT);
        assert_eq!(config.forwarding.cache_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.api_version.default, 1);
    }

    #[test]
    fn clamps_num_markers() {
        let doc = r#"
            num_markers = 9000
            [[etl_sources]]
            ip = "127.0.0.1"
            ws_port = 1
            grpc_port = 2
        "#;
        let config = Config::from_toml_str(doc).unwrap();
        assert_eq!(config.num_markers, NUM_MARKERS_MAX);
    }

    #[test]
    fn zero_cache_timeout_disables_cache() {
        let doc = r#"
            [[etl_sources]]
            ip = "127.0.0.1"
            ws_port = 1
            grpc_port = 2
        "#;
        let config = Config::from_toml_str(doc).unwrap();
        assert!(config.forwarding.cache_timeout.is_none());
    }

    #[test]
    fn rejects_empty_sources() {
        let doc = "etl_sources = []";
        assert!(Config::from_toml_str(doc).is_err());
    }
}
