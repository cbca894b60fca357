// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service Identity & Endpoints
//!
//! Value objects describing the managed service: who it is (bound once at
//! Load) and which network-facing capabilities it exposes.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Identity binding and endpoint discovery from the service manifest

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Immutable identity of the managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub workspace: String,
    pub version: String,
    /// Filesystem root of the service (contains `service.yaml` and `src/`)
    pub location: PathBuf,
}

impl ServiceIdentity {
    /// `module/name`, unique inside a workspace
    pub fn unique(&self) -> String {
        format!("{}/{}", self.module, self.name)
    }

    /// Unique name including the workspace, safe to use for container names
    pub fn unique_with_workspace(&self) -> String {
        let raw = if self.workspace.is_empty() {
            format!("{}-{}", self.module, self.name)
        } else {
            format!("{}-{}-{}", self.workspace, self.module, self.name)
        };
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_ascii_lowercase() } else { '-' })
            .collect()
    }

    /// Resolve a path relative to the service root
    pub fn local(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.location.join(relative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Private
    }
}

/// Protocol tag of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKind {
    Rest,
    Grpc,
    Http,
    Tcp,
}

impl std::fmt::Display for ApiKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApiKind::Rest => "rest",
            ApiKind::Grpc => "grpc",
            ApiKind::Http => "http",
            ApiKind::Tcp => "tcp",
        };
        f.write_str(s)
    }
}

/// A named network-facing capability of a service.
///
/// Identity is `(module, service, name)`; the api tag and visibility are
/// attributes, not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub module: String,
    pub service: String,
    pub name: String,
    pub api: ApiKind,
    #[serde(default)]
    pub visibility: Visibility,
}

impl Endpoint {
    pub fn same_identity(&self, other: &Endpoint) -> bool {
        self.module == other.module && self.service == other.service && self.name == other.name
    }

    /// `module/service/name`
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.module, self.service, self.name)
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service manifest not found at {0}")]
    ManifestNotFound(PathBuf),

    #[error("Failed to read service manifest {path}: {reason}")]
    ManifestUnreadable { path: PathBuf, reason: String },

    #[error("Service manifest declares '{found}' but Load was called for '{expected}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("No REST endpoint declared for service {0}")]
    NoRestEndpoint(String),
}

/// Endpoint declaration as written in the service manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDeclaration {
    pub name: String,
    pub api: ApiKind,
    #[serde(default)]
    pub visibility: Visibility,
}

/// The `service.yaml` file at the root of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub module: String,
    pub version: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointDeclaration>,
}

impl ServiceManifest {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ServiceError> {
        if !path.exists() {
            return Err(ServiceError::ManifestNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| ServiceError::ManifestUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&content).map_err(|e| ServiceError::ManifestUnreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load the endpoints of `identity`, checking the manifest belongs to it.
    pub fn load_endpoints(identity: &ServiceIdentity, manifest_file: &str) -> Result<Vec<Endpoint>, ServiceError> {
        let manifest = Self::from_yaml_file(&identity.local(manifest_file))?;
        if manifest.name != identity.name || manifest.module != identity.module {
            return Err(ServiceError::IdentityMismatch {
                expected: identity.unique(),
                found: format!("{}/{}", manifest.module, manifest.name),
            });
        }
        Ok(manifest
            .endpoints
            .into_iter()
            .map(|decl| Endpoint {
                module: identity.module.clone(),
                service: identity.name.clone(),
                name: decl.name,
                api: decl.api,
                visibility: decl.visibility,
            })
            .collect())
    }
}

/// Find the REST endpoint among the declared endpoints (first one wins).
pub fn find_rest_endpoint(service: &str, endpoints: &[Endpoint]) -> Result<Endpoint, ServiceError> {
    endpoints
        .iter()
        .find(|e| e.api == ApiKind::Rest)
        .cloned()
        .ok_or_else(|| ServiceError::NoRestEndpoint(service.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(root: &Path) -> ServiceIdentity {
        ServiceIdentity {
            name: "users".to_string(),
            module: "backend".to_string(),
            workspace: "demo".to_string(),
            version: "0.1.0".to_string(),
            location: root.to_path_buf(),
        }
    }

    #[test]
    fn test_load_endpoints_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("service.yaml"),
            "name: users\nmodule: backend\nversion: 0.1.0\nendpoints:\n  - name: rest\n    api: rest\n",
        )
        .unwrap();

        let endpoints = ServiceManifest::load_endpoints(&identity(dir.path()), "service.yaml").unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].key(), "backend/users/rest");
        assert_eq!(endpoints[0].visibility, Visibility::Private);

        let rest = find_rest_endpoint("users", &endpoints).unwrap();
        assert_eq!(rest.api, ApiKind::Rest);
    }

    #[test]
    fn test_manifest_identity_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("service.yaml"),
            "name: orders\nmodule: backend\nversion: 0.1.0\n",
        )
        .unwrap();

        let err = ServiceManifest::load_endpoints(&identity(dir.path()), "service.yaml").unwrap_err();
        assert!(matches!(err, ServiceError::IdentityMismatch { .. }));
    }

    #[test]
    fn test_no_rest_endpoint() {
        let endpoints = vec![Endpoint {
            module: "backend".into(),
            service: "users".into(),
            name: "grpc".into(),
            api: ApiKind::Grpc,
            visibility: Visibility::Private,
        }];
        assert!(matches!(
            find_rest_endpoint("users", &endpoints),
            Err(ServiceError::NoRestEndpoint(_))
        ));
    }

    #[test]
    fn test_unique_with_workspace_is_container_safe() {
        let id = identity(Path::new("/tmp/x"));
        assert_eq!(id.unique_with_workspace(), "demo-backend-users");
    }
}
