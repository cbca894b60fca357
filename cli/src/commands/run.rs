// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `svcagent run <root>`: Load, Init and Start a service locally, Stop on Ctrl+C

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use svcagent_core::domain::network::{NetworkInstance, NetworkMapping, NetworkScope};
use svcagent_core::domain::requests::{InitRequest, LoadRequest, StartRequest};
use svcagent_core::domain::runtime::ExecutionScope;
use svcagent_core::domain::service::find_rest_endpoint;
use tokio_util::sync::CancellationToken;

use crate::host;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Service root (contains service.yaml)
    #[arg(value_name = "DIR", default_value = ".")]
    pub root: PathBuf,

    /// Execution scope: native or container (default: probe)
    #[arg(long)]
    pub scope: Option<ExecutionScope>,

    /// Port the service listens on
    #[arg(long, default_value = "8080")]
    pub port: u16,

    /// Workspace the service belongs to
    #[arg(long, default_value = "")]
    pub workspace: String,

    /// Run the test suite after the service started
    #[arg(long)]
    pub test: bool,
}

/// Native and container mappings for the service's REST endpoint on `port`
fn local_mappings(endpoint: svcagent_core::domain::service::Endpoint, port: u16) -> Vec<NetworkMapping> {
    vec![NetworkMapping {
        endpoint,
        instances: vec![
            NetworkInstance::new(NetworkScope::Native, "127.0.0.1", port),
            NetworkInstance::new(NetworkScope::Container, "host.docker.internal", port),
        ],
    }]
}

pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = host::load_config(config_path)?;
    host::install_metrics(&config.spec.observability.metrics)?;
    let identity = host::identity_from_root(&args.root, &config.spec.runtime.service_manifest, &args.workspace)?;

    let runtime = host::build_runtime(&config);
    let printer = host::spawn_event_printer(&runtime);

    let loaded = runtime
        .load(LoadRequest { identity: identity.clone(), environment: "local".to_string(), make_public: false })
        .await
        .context("Load failed")?;
    let rest = find_rest_endpoint(&identity.name, &loaded.endpoints)?;

    // Ctrl+C during a long install kills the installer
    let cancel = CancellationToken::new();
    let init = runtime.init_cancellable(
        InitRequest {
            scope: args.scope,
            proposed_network_mappings: local_mappings(rest, args.port),
            ..Default::default()
        },
        &cancel,
    );
    tokio::pin!(init);
    tokio::select! {
        result = &mut init => { result.context("Init failed")?; }
        _ = host::shutdown_signal() => {
            // Init kills the installer's process group once it sees the token
            cancel.cancel();
            let _ = (&mut init).await;
            printer.abort();
            anyhow::bail!("Interrupted during Init");
        }
    }

    runtime.start(StartRequest::default()).await.context("Start failed")?;
    println!(
        "{}",
        format!("✓ {} running on http://127.0.0.1:{} (Ctrl+C to stop)", identity.unique(), args.port).green()
    );

    if args.test {
        let result = runtime.test().await.context("Test failed")?;
        if result.passed {
            println!("{}", "✓ Tests passed".green());
        } else {
            println!("{}", format!("✗ Tests failed (exit code {:?})", result.exit_code).red());
        }
    }

    host::shutdown_signal().await;
    let stopped = runtime.stop().await;
    printer.abort();
    stopped.context("Stop failed")?;
    println!("{}", "✓ Service stopped".green());
    Ok(())
}
