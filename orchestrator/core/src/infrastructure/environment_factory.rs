// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution Environment Factory
//!
//! Picks and builds the execution backend for a service. The lifecycle
//! orchestrator never names a concrete backend, which keeps it testable
//! against in-memory environments.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Scope selection (toolchain probe) and backend construction

use crate::domain::agent_config::{ContainerConfig, RuntimeConfig};
use crate::domain::runtime::{ExecutionEnvironment, ExecutionScope, RuntimeError};
use crate::domain::service::ServiceIdentity;
use crate::infrastructure::docker::{self, ContainerEnvironment};
use crate::infrastructure::native::{probe_toolchain, NativeEnvironment};
use async_trait::async_trait;
use tracing::{debug, info};

/// Deterministic container name for a service
pub fn container_name(identity: &ServiceIdentity) -> String {
    format!("svcagent-{}", identity.unique_with_workspace())
}

#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    /// Scope to use when neither the request nor the configuration names one
    fn probe_scope(&self) -> ExecutionScope;

    /// Build an uninitialized environment for `identity`
    fn create(
        &self,
        scope: ExecutionScope,
        identity: &ServiceIdentity,
    ) -> Result<Box<dyn ExecutionEnvironment>, RuntimeError>;

    /// Remove state that outlives the environment (the service container)
    async fn remove_persistent(&self, identity: &ServiceIdentity) -> Result<(), RuntimeError>;
}

/// Native processes via `tokio::process`, containers via Docker
pub struct DefaultEnvironmentFactory {
    runtime: RuntimeConfig,
    container: ContainerConfig,
}

impl DefaultEnvironmentFactory {
    pub fn new(runtime: RuntimeConfig, container: ContainerConfig) -> Self {
        Self { runtime, container }
    }
}

#[async_trait]
impl EnvironmentFactory for DefaultEnvironmentFactory {
    fn probe_scope(&self) -> ExecutionScope {
        if probe_toolchain(&self.runtime.toolchain) {
            info!("Native toolchain found ({:?}), using native scope", self.runtime.toolchain);
            ExecutionScope::Native
        } else {
            info!("Native toolchain incomplete ({:?}), falling back to container scope", self.runtime.toolchain);
            ExecutionScope::Container
        }
    }

    fn create(
        &self,
        scope: ExecutionScope,
        identity: &ServiceIdentity,
    ) -> Result<Box<dyn ExecutionEnvironment>, RuntimeError> {
        match scope {
            ExecutionScope::Native => {
                Ok(Box::new(NativeEnvironment::new(identity.local(&self.runtime.source_dir))))
            }
            ExecutionScope::Container => {
                let client = docker::connect(self.container.docker_socket_path.as_deref())?;
                Ok(Box::new(ContainerEnvironment::new(
                    client,
                    container_name(identity),
                    self.container.image.clone(),
                    self.container.source_target.clone(),
                )))
            }
        }
    }

    async fn remove_persistent(&self, identity: &ServiceIdentity) -> Result<(), RuntimeError> {
        let client = match docker::connect(self.container.docker_socket_path.as_deref()) {
            Ok(client) => client,
            Err(e) => {
                debug!("Docker unavailable, no container to remove: {}", e);
                return Ok(());
            }
        };
        if client.ping().await.is_err() {
            debug!("Docker daemon not reachable, no container to remove");
            return Ok(());
        }
        docker::remove_container(&client, &container_name(identity)).await
    }
}
