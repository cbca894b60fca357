// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `svcagent serve`: expose the lifecycle over HTTP for an orchestrator

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use svcagent_core::presentation::api;
use tokio::net::TcpListener;
use tracing::info;

use crate::host;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bind address (default: spec.network.bind_address)
    #[arg(long, env = "SVCAGENT_HOST")]
    pub host: Option<String>,

    /// Bind port (default: spec.network.port)
    #[arg(long, env = "SVCAGENT_PORT")]
    pub port: Option<u16>,
}

pub async fn execute(args: ServeArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = host::load_config(config_path)?;
    host::install_metrics(&config.spec.observability.metrics)?;

    let runtime = host::build_runtime(&config);
    let app = api::app(runtime.clone());

    let host = args.host.unwrap_or_else(|| config.spec.network.bind_address.clone());
    let port = args.port.unwrap_or(config.spec.network.port);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(agent = %config.metadata.name, "Agent listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(host::shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Agent shutting down");
    // Never leave a supervised process or container behind
    if let Err(e) = runtime.stop().await {
        tracing::warn!("Stop during shutdown reported: {}", e);
    }
    Ok(())
}
