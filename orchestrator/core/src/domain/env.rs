// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Environment Variables
//!
//! Builds the environment handed to the service process from the
//! orchestrator's inputs: identity, configuration values, secrets and
//! network mappings.
//!
//! # Naming
//!
//! | Source | Variable |
//! |--------|----------|
//! | identity | `SVCAGENT__SERVICE`, `SVCAGENT__MODULE`, `SVCAGENT__VERSION`, `SVCAGENT__WORKSPACE` |
//! | configuration | `SVCAGENT__CONFIGURATION__<NAME>__<KEY>` |
//! | secret | `SVCAGENT__SECRET_CONFIGURATION__<NAME>__<KEY>` |
//! | endpoint | `SVCAGENT__ENDPOINT__<MODULE>__<SERVICE>__<NAME>__<API>` |
//! | live marker | `SVCAGENT__RUNNING=true` |

use crate::domain::network::{instances_at_scope, NetworkMapping, NetworkScope};
use crate::domain::runtime::ExecutionScope;
use crate::domain::service::ServiceIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PREFIX: &str = "SVCAGENT";
pub const RUNNING_KEY: &str = "SVCAGENT__RUNNING";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationValue {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

/// A named group of values, e.g. a database connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationInformation {
    pub name: String,
    #[serde(default)]
    pub values: Vec<ConfigurationValue>,
}

/// Configuration supplied by the orchestrator for one origin (this service,
/// a dependency, or the workspace)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub origin: String,
    /// `None` applies to every scope
    #[serde(default)]
    pub scope: Option<ExecutionScope>,
    #[serde(default)]
    pub infos: Vec<ConfigurationInformation>,
}

/// Keep configurations that apply to `scope`
pub fn filter_configurations(configurations: &[Configuration], scope: ExecutionScope) -> Vec<Configuration> {
    configurations
        .iter()
        .filter(|c| c.scope.map_or(true, |s| s == scope))
        .cloned()
        .collect()
}

fn normalize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Ordered variable set; later additions override earlier ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentVariables {
    vars: BTreeMap<String, String>,
}

impl EnvironmentVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn add_identity(&mut self, identity: &ServiceIdentity) {
        self.set(format!("{PREFIX}__SERVICE"), identity.name.clone());
        self.set(format!("{PREFIX}__MODULE"), identity.module.clone());
        self.set(format!("{PREFIX}__VERSION"), identity.version.clone());
        self.set(format!("{PREFIX}__WORKSPACE"), identity.workspace.clone());
    }

    pub fn add_environment(&mut self, environment: &str) {
        self.set(format!("{PREFIX}__ENVIRONMENT"), environment.to_string());
    }

    pub fn add_configurations(&mut self, configurations: &[Configuration]) {
        for configuration in configurations {
            for info in &configuration.infos {
                for value in &info.values {
                    let kind = if value.secret { "SECRET_CONFIGURATION" } else { "CONFIGURATION" };
                    let key = format!("{PREFIX}__{kind}__{}__{}", normalize(&info.name), normalize(&value.key));
                    self.set(key, value.value.clone());
                }
            }
        }
    }

    /// Expose every mapped endpoint reachable at the runtime's scope
    pub fn add_endpoints(&mut self, mappings: &[NetworkMapping], scope: ExecutionScope) {
        for (endpoint, instance) in instances_at_scope(mappings, NetworkScope::for_execution(scope)) {
            let key = format!(
                "{PREFIX}__ENDPOINT__{}__{}__{}__{}",
                normalize(&endpoint.module),
                normalize(&endpoint.service),
                normalize(&endpoint.name),
                normalize(&endpoint.api.to_string()),
            );
            self.set(key, instance.url());
        }
    }

    pub fn extend(&mut self, other: &BTreeMap<String, String>) {
        self.vars.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn secrets(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter().filter(|(k, _)| k.starts_with(&format!("{PREFIX}__SECRET_CONFIGURATION__")))
    }

    pub fn all(&self) -> BTreeMap<String, String> {
        self.vars.clone()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
