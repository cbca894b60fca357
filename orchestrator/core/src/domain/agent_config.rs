// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Agent Configuration Types
//
// Defines the configuration schema for the service runtime agent:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Installer, schema generator, server and test commands
// - Hot reload and container settings
// - Orchestrator API and observability settings

use crate::domain::runtime::ExecutionScope;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const API_VERSION: &str = "svcagent/v1";
pub const KIND: &str = "AgentConfig";
const MAX_DEBOUNCE_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

/// Top-level Kubernetes-style agent configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigManifest {
    /// API version (must be "svcagent/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "AgentConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: AgentConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfigSpec {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub installer: InstallerConfig,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tests: TestsConfig,

    #[serde(default)]
    pub hot_reload: HotReloadConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Scope used when Init does not name one. Unset means probe the host
    /// for a native toolchain and fall back to container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_scope: Option<ExecutionScope>,

    /// Service manifest file, relative to the service root
    #[serde(default = "default_service_manifest")]
    pub service_manifest: String,

    /// Source directory, relative to the service root
    #[serde(default = "default_source_dir")]
    pub source_dir: String,

    /// Cache directory, relative to the service root
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Binaries that must resolve on the host search path for native execution
    #[serde(default = "default_toolchain")]
    pub toolchain: Vec<String>,

    /// Static variables added to every process
    #[serde(default = "default_runtime_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_scope: None,
            service_manifest: default_service_manifest(),
            source_dir: default_source_dir(),
            cache_dir: default_cache_dir(),
            toolchain: default_toolchain(),
            env: default_runtime_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default = "default_poetry")]
    pub binary: String,

    /// Dependency manifest, relative to the source directory
    #[serde(default = "default_installer_manifest")]
    pub manifest: String,

    /// Arguments used when no dependency fingerprint exists yet
    #[serde(default = "default_install_args")]
    pub install_args: Vec<String>,

    /// Arguments used when the dependency fingerprint changed
    #[serde(default = "default_update_args")]
    pub update_args: Vec<String>,

    /// Glob patterns (relative to the source directory) fingerprinted
    /// alongside the manifest
    #[serde(default)]
    pub include: Vec<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            binary: default_poetry(),
            manifest: default_installer_manifest(),
            install_args: default_install_args(),
            update_args: default_update_args(),
            include: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poetry")]
    pub binary: String,

    #[serde(default = "default_schema_args")]
    pub args: Vec<String>,

    /// Files (relative to the source directory) the schema is generated from
    #[serde(default = "default_schema_inputs")]
    pub inputs: Vec<String>,

    /// Generated artifact directory, relative to the service root
    #[serde(default = "default_schema_artifact_dir")]
    pub artifact_dir: String,

    /// File names the generator writes; changes to them never restart the service
    #[serde(default = "default_schema_artifacts")]
    pub artifacts: Vec<String>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_poetry(),
            args: default_schema_args(),
            inputs: default_schema_inputs(),
            artifact_dir: default_schema_artifact_dir(),
            artifacts: default_schema_artifacts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_poetry")]
    pub binary: String,

    /// Server arguments. `{port}` is replaced with the resolved port.
    #[serde(default = "default_server_args")]
    pub args: Vec<String>,

    /// Seconds between the graceful stop signal and the forced kill
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_poetry(),
            args: default_server_args(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

impl ServerConfig {
    pub fn render_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsConfig {
    #[serde(default = "default_poetry")]
    pub binary: String,

    #[serde(default = "default_test_args")]
    pub args: Vec<String>,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self { binary: default_poetry(), args: default_test_args() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Window in which change bursts collapse into one restart
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// The server reloads these extensions itself; the agent ignores them
    #[serde(default = "default_delegated_extensions")]
    pub delegated_extensions: Vec<String>,

    /// Path components never watched
    #[serde(default = "default_ignored")]
    pub ignore: Vec<String>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            delegated_extensions: default_delegated_extensions(),
            ignore: default_ignored(),
        }
    }
}

impl HotReloadConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Must provide the installer, schema, server and test binaries on PATH
    #[serde(default = "default_image")]
    pub image: String,

    /// Path to the Docker socket. Unset uses the local defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_socket_path: Option<String>,

    /// Where the source directory is mounted
    #[serde(default = "default_source_target")]
    pub source_target: String,

    /// Where the persistent dependency cache is mounted
    #[serde(default = "default_venv_target")]
    pub venv_target: String,

    /// Where the schema artifact directory is mounted (read-only)
    #[serde(default = "default_schema_target")]
    pub schema_target: String,

    /// Extra variables for the container, e.g. pointing the installer at the cache mount
    #[serde(default = "default_container_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            docker_socket_path: None,
            source_target: default_source_target(),
            venv_target: default_venv_target(),
            schema_target: default_schema_target(),
            env: default_container_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Orchestrator API bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_api_port() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false, port: default_metrics_port() }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_poetry() -> String {
    "poetry".to_string()
}

fn default_service_manifest() -> String {
    "service.yaml".to_string()
}

fn default_source_dir() -> String {
    "src".to_string()
}

fn default_cache_dir() -> String {
    ".cache".to_string()
}

fn default_toolchain() -> Vec<String> {
    vec!["python3".to_string(), "poetry".to_string()]
}

fn default_runtime_env() -> BTreeMap<String, String> {
    BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())])
}

fn default_installer_manifest() -> String {
    "pyproject.toml".to_string()
}

fn default_install_args() -> Vec<String> {
    vec!["install".to_string(), "--no-root".to_string()]
}

fn default_update_args() -> Vec<String> {
    vec!["update".to_string()]
}

fn default_schema_args() -> Vec<String> {
    ["run", "python", "openapi.py"].iter().map(|s| s.to_string()).collect()
}

fn default_schema_inputs() -> Vec<String> {
    vec!["main.py".to_string()]
}

fn default_schema_artifact_dir() -> String {
    "openapi".to_string()
}

fn default_schema_artifacts() -> Vec<String> {
    vec!["api.json".to_string()]
}

fn default_server_args() -> Vec<String> {
    ["run", "uvicorn", "main:app", "--reload", "--host", "0.0.0.0", "--port", "{port}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_stop_grace() -> u64 {
    10
}

fn default_test_args() -> Vec<String> {
    ["run", "pytest", "-v"].iter().map(|s| s.to_string()).collect()
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_delegated_extensions() -> Vec<String> {
    vec!["py".to_string()]
}

fn default_ignored() -> Vec<String> {
    [".cache", "__pycache__", ".pytest_cache", ".venv"].iter().map(|s| s.to_string()).collect()
}

/// Python runtime image with poetry preinstalled
pub const DEFAULT_IMAGE: &str = "codeflydev/python-poetry:0.0.1";

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_source_target() -> String {
    "/app".to_string()
}

fn default_venv_target() -> String {
    "/venv".to_string()
}

fn default_schema_target() -> String {
    "/openapi".to_string()
}

fn default_container_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("POETRY_VIRTUALENVS_CREATE".to_string(), "true".to_string()),
        ("POETRY_VIRTUALENVS_PATH".to_string(), "/venv".to_string()),
    ])
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8700
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for AgentConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "svcagent".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata { name: hostname, labels: None },
            spec: AgentConfigSpec::default(),
        }
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AgentConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. SVCAGENT_CONFIG_PATH environment variable
    /// 2. ./svcagent.yaml (working directory)
    /// 3. ~/.svcagent/config.yaml (user home)
    /// 4. /etc/svcagent/config.yaml (system, Unix) or C:\ProgramData\svcagent\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("SVCAGENT_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./svcagent.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".svcagent").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/svcagent/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\svcagent\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SVCAGENT_HOT_RELOAD") {
            match parse_bool(&val) {
                Some(enabled) => {
                    tracing::info!("Environment override: SVCAGENT_HOT_RELOAD={}", enabled);
                    self.spec.hot_reload.enabled = enabled;
                }
                None => tracing::warn!(
                    "Invalid value for SVCAGENT_HOT_RELOAD: '{}'. Expected true/false. Ignoring.",
                    val
                ),
            }
        }

        if let Ok(val) = std::env::var("SVCAGENT_DEFAULT_SCOPE") {
            match val.parse::<ExecutionScope>() {
                Ok(scope) => {
                    tracing::info!("Environment override: SVCAGENT_DEFAULT_SCOPE={}", scope);
                    self.spec.runtime.default_scope = Some(scope);
                }
                Err(e) => tracing::warn!("Invalid value for SVCAGENT_DEFAULT_SCOPE: {}. Ignoring.", e),
            }
        }

        if let Ok(val) = std::env::var("SVCAGENT_DOCKER_SOCKET") {
            tracing::info!("Environment override: SVCAGENT_DOCKER_SOCKET={}", val);
            self.spec.container.docker_socket_path = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version, API_VERSION
            )));
        }

        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND)));
        }

        if self.metadata.name.is_empty() {
            return Err(ConfigError::Invalid("metadata.name cannot be empty".into()));
        }

        let spec = &self.spec;
        for (field, binary) in [
            ("installer.binary", &spec.installer.binary),
            ("server.binary", &spec.server.binary),
            ("tests.binary", &spec.tests.binary),
        ] {
            if binary.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("spec.{} cannot be empty", field)));
            }
        }

        if spec.schema.enabled && spec.schema.binary.trim().is_empty() {
            return Err(ConfigError::Invalid("spec.schema.binary cannot be empty".into()));
        }

        if spec.installer.manifest.is_empty() {
            return Err(ConfigError::Invalid("spec.installer.manifest cannot be empty".into()));
        }

        if spec.hot_reload.debounce_ms == 0 || spec.hot_reload.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(ConfigError::Invalid(format!(
                "spec.hot_reload.debounce_ms must be between 1 and {}",
                MAX_DEBOUNCE_MS
            )));
        }

        if spec.server.stop_grace_seconds == 0 {
            return Err(ConfigError::Invalid("spec.server.stop_grace_seconds must be positive".into()));
        }

        if !spec.server.args.iter().any(|a| a.contains("{port}")) {
            tracing::warn!("spec.server.args has no {{port}} placeholder; the resolved port is not passed");
        }

        Ok(())
    }
}
