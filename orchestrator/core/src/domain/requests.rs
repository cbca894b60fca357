// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Orchestrator requests and responses for each lifecycle operation.

use crate::domain::env::Configuration;
use crate::domain::lifecycle::LifecycleState;
use crate::domain::network::NetworkMapping;
use crate::domain::runtime::ExecutionScope;
use crate::domain::service::{Endpoint, ServiceIdentity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadRequest {
    pub identity: ServiceIdentity,
    /// Orchestrator environment name, e.g. "local"
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Promote every endpoint to public visibility
    #[serde(default)]
    pub make_public: bool,
}

fn default_environment() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResponse {
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitRequest {
    /// Unset lets the agent probe for a native toolchain
    #[serde(default)]
    pub scope: Option<ExecutionScope>,
    #[serde(default)]
    pub proposed_network_mappings: Vec<NetworkMapping>,
    #[serde(default)]
    pub configuration: Option<Configuration>,
    #[serde(default)]
    pub dependencies_configurations: Vec<Configuration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub scope: ExecutionScope,
    /// Mappings for this service's own endpoints
    pub network_mappings: Vec<NetworkMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub dependencies_network_mappings: Vec<NetworkMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub exit_code: Option<i64>,
    /// Tail of the test command output
    pub output: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Information {
    pub identity: Option<ServiceIdentity>,
    pub state: LifecycleState,
    pub scope: Option<ExecutionScope>,
    pub address: Option<String>,
    pub process_id: Option<String>,
    pub running: bool,
    pub hot_reload: bool,
}
