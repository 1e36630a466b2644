//! Process entry point: parses CLI/env options, loads the TOML config
//! document, starts the `App` (Sources + LoadBalancer + FeedEngine), and
//! runs until a shutdown signal (§6.1).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use clio_rs::{backend::NullBackend, config::Options, init_tracing, load_config, App};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    init_tracing(&options.log_level, options.log_format);

    let config = load_config(&options.config)?;
    info!(bind = %options.bind, sources = config.sources.len(), "starting clio");

    // No real storage backend is wired up yet; the storage engine's
    // internals are out of scope (§1 Non-goals). A process that needs one
    // constructs it here and passes it in place of `NullBackend`.
    let backend = Arc::new(NullBackend);
    let app = App::start(&config, backend);

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    app.shutdown();

    Ok(())
}
