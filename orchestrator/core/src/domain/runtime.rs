// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution Environment Contract
//!
//! One capability interface over the two ways the managed service can run:
//! directly on the host (`Native`) or inside an isolated container
//! (`Container`). The lifecycle orchestrator only talks to this trait.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Trait seam between lifecycle logic and process/container backends

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Output lines kept for error reports and test results
pub const OUTPUT_TAIL_LINES: usize = 200;

/// Where the service process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionScope {
    Native,
    Container,
}

impl ExecutionScope {
    /// Directory name of the scope's cache under `.cache/`.
    ///
    /// Installed artifacts are not interchangeable between scopes, so each
    /// one gets its own cache root.
    pub fn cache_dir_name(&self) -> &'static str {
        match self {
            ExecutionScope::Native => "local",
            ExecutionScope::Container => "container",
        }
    }
}

impl std::fmt::Display for ExecutionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionScope::Native => f.write_str("native"),
            ExecutionScope::Container => f.write_str("container"),
        }
    }
}

impl std::str::FromStr for ExecutionScope {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" | "local" => Ok(ExecutionScope::Native),
            "container" | "docker" => Ok(ExecutionScope::Container),
            other => Err(RuntimeError::Unsupported(format!(
                "Unknown execution scope '{}'. Supported: native, container",
                other
            ))),
        }
    }
}

/// Host path made visible inside the execution environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn new(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self { host: host.into(), target: target.into(), read_only: false }
    }

    pub fn read_only(host: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self { host: host.into(), target: target.into(), read_only: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything needed to launch one child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn with_envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Human readable command line, used in logs and error reports
    pub fn command_line(&self) -> String {
        std::iter::once(self.binary.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives the output of supervised processes, line by line
pub trait OutputSink: Send + Sync {
    fn write_line(&self, stream: OutputStream, line: &str);
}

/// Forwards process output into `tracing` under the `service_output` target
pub struct TracingOutputSink {
    service: String,
}

impl TracingOutputSink {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

impl OutputSink for TracingOutputSink {
    fn write_line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => tracing::info!(target: "service_output", service = %self.service, "{}", line),
            OutputStream::Stderr => tracing::warn!(target: "service_output", service = %self.service, "{}", line),
        }
    }
}

/// Forwards to an inner sink while keeping the last `capacity` lines.
///
/// The retained tail is what gets attached to external-command errors.
#[derive(Clone)]
pub struct CapturingSink {
    inner: Arc<dyn OutputSink>,
    tail: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl CapturingSink {
    pub fn new(inner: Arc<dyn OutputSink>, capacity: usize) -> Self {
        Self {
            inner,
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }
}

impl OutputSink for CapturingSink {
    fn write_line(&self, stream: OutputStream, line: &str) {
        self.inner.write_line(stream, line);
        let mut tail = self.tail.lock();
        if tail.len() == self.capacity {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
}

/// Result of a process run to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub exit_code: Option<i64>,
    /// Tail of the combined stdout/stderr
    pub lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to execute process: {0}")]
    ExecutionFailed(String),

    #[error("Failed to terminate process: {0}")]
    TerminationFailed(String),

    #[error("Binary not found in search path: {0}")]
    BinaryNotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Port {0} must be bound before the environment is initialized")]
    PortBindingAfterInit(u16),

    #[error("Execution environment is not initialized")]
    NotInitialized,

    #[error("Environment setup failed: {0}")]
    SetupFailed(String),

    #[error("A process is already running: {0}")]
    AlreadyRunning(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// A running child owned by the process supervisor
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// PID for native processes, exec id for container processes
    fn id(&self) -> String;

    async fn is_running(&self) -> bool;

    /// Graceful termination, escalating to a forced kill after `grace`.
    /// Must succeed when the process already exited.
    async fn terminate(&mut self, grace: Duration) -> Result<(), RuntimeError>;
}

/// Native or containerized execution backend.
///
/// Configuration methods (`with_*`) are only valid before `init`; ports in
/// particular can never be bound once the environment exists.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    fn scope(&self) -> ExecutionScope;

    /// Variables added to every process created by this environment
    fn with_environment_variables(&mut self, vars: BTreeMap<String, String>);

    fn with_mount(&mut self, mount: Mount) -> Result<(), RuntimeError>;

    fn with_port(&mut self, binding: PortBinding) -> Result<(), RuntimeError>;

    async fn init(&mut self) -> Result<(), RuntimeError>;

    fn new_process(&self, binary: &str, args: &[String]) -> Result<ProcessSpec, RuntimeError>;

    /// Run to completion. Cancelling `cancel` kills the child.
    async fn run(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RuntimeError>;

    /// Start in the background, streaming output to `output`
    async fn spawn(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError>;

    /// Release everything `init` acquired. Idempotent.
    async fn shutdown(&mut self) -> Result<(), RuntimeError>;
}
