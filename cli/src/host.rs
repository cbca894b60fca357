// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Runtime wiring shared by the `serve`, `run` and `reset` commands.

use anyhow::{Context, Result};
use colored::Colorize;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use svcagent_core::application::ServiceRuntime;
use svcagent_core::domain::agent_config::{AgentConfigManifest, MetricsConfig};
use svcagent_core::domain::events::LifecycleEvent;
use svcagent_core::domain::service::{ServiceIdentity, ServiceManifest};
use svcagent_core::infrastructure::event_bus::EventBusError;
use svcagent_core::infrastructure::{DefaultEnvironmentFactory, EventBus};
use tokio::signal;
use tracing::info;

/// Load, override and validate the agent configuration
pub fn load_config(config_path: Option<PathBuf>) -> Result<AgentConfigManifest> {
    let config = AgentConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

pub fn build_runtime(config: &AgentConfigManifest) -> ServiceRuntime {
    let spec = config.spec.clone();
    let factory = Arc::new(DefaultEnvironmentFactory::new(spec.runtime.clone(), spec.container.clone()));
    ServiceRuntime::new(spec, factory, Arc::new(EventBus::with_default_capacity()))
}

/// Install the Prometheus exporter when metrics are enabled
pub fn install_metrics(metrics: &MetricsConfig) -> Result<()> {
    if !metrics.enabled {
        return Ok(());
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

/// Identity of the service rooted at `root`, taken from its manifest
pub fn identity_from_root(root: &Path, manifest_file: &str, workspace: &str) -> Result<ServiceIdentity> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Service root {:?} does not exist", root))?;
    let manifest = ServiceManifest::from_yaml_file(&root.join(manifest_file))
        .with_context(|| format!("Failed to read service manifest in {:?}", root))?;
    Ok(ServiceIdentity {
        name: manifest.name,
        module: manifest.module,
        workspace: workspace.to_string(),
        version: manifest.version,
        location: root,
    })
}

/// Print lifecycle events as they happen
pub fn spawn_event_printer(runtime: &ServiceRuntime) -> tokio::task::JoinHandle<()> {
    let mut events = runtime.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", describe(&event)),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    })
}

fn describe(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::Loaded { service, endpoints, .. } => {
            format!("{} {} ({} endpoint(s))", "loaded".cyan(), service, endpoints)
        }
        LifecycleEvent::Initialized { service, scope, address, .. } => {
            format!("{} {} [{}] at {}", "initialized".cyan(), service, scope, address)
        }
        LifecycleEvent::DependenciesInstalled { verb, duration_ms, .. } => {
            format!("{} dependencies ({:?}, {} ms)", "installed".cyan(), verb, duration_ms)
        }
        LifecycleEvent::SchemaGenerated { .. } => format!("{} API schema", "generated".cyan()),
        LifecycleEvent::Started { service, process_id, .. } => {
            format!("{} {} (process {})", "started".green(), service, process_id)
        }
        LifecycleEvent::RestartRequested { changed_paths, .. } => {
            format!("{} {}", "changed".yellow(), changed_paths.join(", "))
        }
        LifecycleEvent::Restarted { process_id, .. } => {
            format!("{} (process {})", "restarted".green(), process_id)
        }
        LifecycleEvent::Stopped { service, .. } => format!("{} {}", "stopped".yellow(), service),
        LifecycleEvent::Reset { service, .. } => format!("{} {}", "reset".yellow(), service),
        LifecycleEvent::Destroyed { service, .. } => format!("{} {}", "destroyed".yellow(), service),
        LifecycleEvent::OperationFailed { phase, error, .. } => {
            format!("{} [{}] {}", "failed".red(), phase, error)
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_root_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("service.yaml"),
            "name: users\nmodule: backend\nversion: 1.2.0\nendpoints: []\n",
        )
        .unwrap();

        let identity = identity_from_root(dir.path(), "service.yaml", "demo").unwrap();
        assert_eq!(identity.name, "users");
        assert_eq!(identity.module, "backend");
        assert_eq!(identity.version, "1.2.0");
        assert_eq!(identity.workspace, "demo");
        assert!(identity.location.is_absolute());
    }

    #[test]
    fn test_identity_from_missing_root_fails() {
        assert!(identity_from_root(Path::new("/nonexistent/svcagent"), "service.yaml", "").is_err());
    }
}
