// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Network Mappings & Resolution
//!
//! The orchestrator assigns concrete host/port pairs to endpoints and hands
//! them to the agent as proposed network mappings. This module only reads
//! them: it never allocates ports.
//!
//! # Resolution Rules
//!
//! | Situation | Result |
//! |-----------|--------|
//! | no mapping for the endpoint, or none at the scope | `NotFound` |
//! | exactly one mapping with instances at the scope | first such instance, in input order |
//! | two or more mappings with instances at the scope | `Ambiguous` |
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Endpoint → (host, port) lookup per visibility scope

use crate::domain::runtime::ExecutionScope;
use crate::domain::service::Endpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Visibility scope an address is reachable from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkScope {
    /// Reachable from outside the host (load balancer, public DNS)
    Public,
    /// Reachable from processes running directly on the host (loopback)
    Native,
    /// Reachable from inside the container network
    Container,
}

impl NetworkScope {
    /// The scope a runtime running under `scope` uses to reach its peers
    pub fn for_execution(scope: ExecutionScope) -> Self {
        match scope {
            ExecutionScope::Native => NetworkScope::Native,
            ExecutionScope::Container => NetworkScope::Container,
        }
    }
}

impl std::fmt::Display for NetworkScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkScope::Public => "public",
            NetworkScope::Native => "native",
            NetworkScope::Container => "container",
        };
        f.write_str(s)
    }
}

/// A concrete address bound to an endpoint under one scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInstance {
    pub scope: NetworkScope,
    pub host: String,
    pub port: u16,
}

impl NetworkInstance {
    pub fn new(scope: NetworkScope, host: impl Into<String>, port: u16) -> Self {
        Self { scope, host: host.into(), port }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `http://host:port`
    pub fn url(&self) -> String {
        format!("http://{}", self.address())
    }
}

/// Proposed (or bound) association between an endpoint and its addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMapping {
    pub endpoint: Endpoint,
    #[serde(default)]
    pub instances: Vec<NetworkInstance>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("No network instance for endpoint {endpoint} at scope {scope}")]
    NotFound { endpoint: String, scope: NetworkScope },

    #[error("Ambiguous network mapping for endpoint {endpoint} at scope {scope}: {count} mappings match")]
    Ambiguous { endpoint: String, scope: NetworkScope, count: usize },
}

/// Find the instance bound to `endpoint` at `scope`.
pub fn find_instance(
    mappings: &[NetworkMapping],
    endpoint: &Endpoint,
    scope: NetworkScope,
) -> Result<NetworkInstance, NetworkError> {
    let candidates: Vec<&NetworkInstance> = mappings
        .iter()
        .filter(|m| m.endpoint.same_identity(endpoint))
        .filter_map(|m| m.instances.iter().find(|i| i.scope == scope))
        .collect();

    match candidates.as_slice() {
        [] => Err(NetworkError::NotFound { endpoint: endpoint.key(), scope }),
        [single] => Ok((*single).clone()),
        many => Err(NetworkError::Ambiguous {
            endpoint: endpoint.key(),
            scope,
            count: many.len(),
        }),
    }
}

/// Every (endpoint, instance) pair reachable at `scope`, in input order.
///
/// Used to expose dependency endpoints to the service; mappings without an
/// instance at the scope are skipped rather than treated as errors.
pub fn instances_at_scope(
    mappings: &[NetworkMapping],
    scope: NetworkScope,
) -> Vec<(&Endpoint, &NetworkInstance)> {
    mappings
        .iter()
        .filter_map(|m| m.instances.iter().find(|i| i.scope == scope).map(|i| (&m.endpoint, i)))
        .collect()
}
