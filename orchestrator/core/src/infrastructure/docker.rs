// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Container Execution Environment
//!
//! Runs the service inside a Docker container created in paused mode: the
//! container idles on `sleep infinity` and every command (installer,
//! schema generator, server, tests) is a `docker exec` inside it.
//!
//! Each exec records its shell PID in a pidfile so it can be signalled
//! later; Docker itself offers no way to stop a single exec.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** `ExecutionEnvironment` over the Docker Engine API (`bollard`)

use crate::domain::runtime::{
    CapturingSink, ExecutionEnvironment, ExecutionScope, Mount, OutputSink, OutputStream, PortBinding,
    ProcessHandle, ProcessOutput, ProcessSpec, RuntimeError, OUTPUT_TAIL_LINES,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IDLE_COMMAND: [&str; 2] = ["sleep", "infinity"];
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect to the Docker daemon (custom socket or auto-detect)
pub fn connect(socket_path: Option<&str>) -> Result<Docker, RuntimeError> {
    if let Some(path) = socket_path {
        #[cfg(unix)]
        let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

        #[cfg(windows)]
        let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

        result.map_err(|e| {
            RuntimeError::SetupFailed(format!(
                "Failed to connect to Docker at {}: {}\n\n\
                 Ensure Docker is running and the socket path is correct.",
                path, e
            ))
        })
    } else {
        Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::SetupFailed(format!(
                "Failed to connect to Docker: {}\n\n\
                 Common causes:\n\
                 - Docker daemon not running (check: docker ps)\n\
                 - Permission denied accessing Docker socket",
                e
            ))
        })
    }
}

/// Force-remove a container by name. A missing container is not an error.
pub async fn remove_container(docker: &Docker, name: &str) -> Result<(), RuntimeError> {
    let options = RemoveContainerOptions { force: true, ..Default::default() };
    match docker.remove_container(name, Some(options)).await {
        Ok(()) => {
            info!("Removed container {}", name);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
        Err(e) => Err(RuntimeError::TerminationFailed(format!("Failed to remove container {}: {}", name, e))),
    }
}

/// Wrap a command so the exec shell writes its PID before replacing itself
fn pid_wrapped(pidfile: &str, spec: &ProcessSpec) -> Vec<String> {
    let mut cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo $$ > {}; exec \"$@\"", pidfile),
        "sh".to_string(),
        spec.binary.clone(),
    ];
    cmd.extend(spec.args.iter().cloned());
    cmd
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn bind(mount: &Mount) -> String {
    let mode = if mount.read_only { ":ro" } else { "" };
    format!("{}:{}{}", mount.host.to_string_lossy(), mount.target, mode)
}

/// Reassembles Docker's byte chunks into lines per stream
#[derive(Default)]
struct LineSplitter {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, log: LogOutput, sink: &dyn OutputSink) {
        let (buf, stream, message) = match log {
            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                (&mut self.stdout, OutputStream::Stdout, message)
            }
            LogOutput::StdErr { message } => (&mut self.stderr, OutputStream::Stderr, message),
            LogOutput::StdIn { .. } => return,
        };
        buf.extend_from_slice(&message);
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            sink.write_line(stream, String::from_utf8_lossy(&line).trim_end_matches(['\n', '\r']));
        }
    }

    fn flush(&mut self, sink: &dyn OutputSink) {
        for (buf, stream) in [(&mut self.stdout, OutputStream::Stdout), (&mut self.stderr, OutputStream::Stderr)] {
            if !buf.is_empty() {
                sink.write_line(stream, &String::from_utf8_lossy(buf));
                buf.clear();
            }
        }
    }
}

pub struct ContainerEnvironment {
    docker: Docker,
    name: String,
    image: String,
    working_dir: String,
    env: BTreeMap<String, String>,
    mounts: Vec<Mount>,
    ports: Vec<PortBinding>,
    container_id: Option<String>,
}

impl ContainerEnvironment {
    /// `name` must be deterministic per service so Reset can find the container
    pub fn new(docker: Docker, name: impl Into<String>, image: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            docker,
            name: name.into(),
            image: image.into(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
            mounts: vec![],
            ports: vec![],
            container_id: None,
        }
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::SetupFailed(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        info!("Pulling image: {}", self.image);
        let options = Some(CreateImageOptions { from_image: self.image.clone(), ..Default::default() });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(RuntimeError::SetupFailed(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    self.image, e, self.image
                )));
            }
        }
        info!("Successfully pulled image: {}", self.image);
        Ok(())
    }

    fn container(&self) -> Result<&str, RuntimeError> {
        self.container_id.as_deref().ok_or(RuntimeError::NotInitialized)
    }

    async fn create_exec(&self, cmd: Vec<String>, spec: &ProcessSpec) -> Result<String, RuntimeError> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            env: Some(env_list(&spec.env)),
            working_dir: Some(spec.working_dir.to_string_lossy().to_string()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(self.container()?, options)
            .await
            .map_err(|e| RuntimeError::SpawnFailed(e.to_string()))?;
        Ok(exec.id)
    }

    async fn start_attached(
        &self,
        exec_id: &str,
    ) -> Result<
        std::pin::Pin<Box<dyn futures::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>,
        RuntimeError,
    > {
        let options = StartExecOptions { detach: false, ..Default::default() };
        match self.docker.start_exec(exec_id, Some(options)).await {
            Ok(StartExecResults::Attached { output, .. }) => Ok(output),
            Ok(StartExecResults::Detached) => {
                Err(RuntimeError::SpawnFailed("exec started detached".to_string()))
            }
            Err(e) => Err(RuntimeError::SpawnFailed(e.to_string())),
        }
    }
}

/// Send `signal` to the process whose PID is in `pidfile`
async fn signal_exec(docker: &Docker, container: &str, pidfile: &str, signal: &str) -> Result<(), RuntimeError> {
    let options = CreateExecOptions {
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("kill -{} $(cat {}) 2>/dev/null || true", signal, pidfile),
        ]),
        ..Default::default()
    };
    let exec = docker
        .create_exec(container, options)
        .await
        .map_err(|e| RuntimeError::TerminationFailed(e.to_string()))?;
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| RuntimeError::TerminationFailed(e.to_string()))?
    {
        while output.next().await.is_some() {}
    }
    Ok(())
}

async fn exec_running(docker: &Docker, exec_id: &str) -> bool {
    match docker.inspect_exec(exec_id).await {
        Ok(inspect) => inspect.running.unwrap_or(false),
        Err(_) => false,
    }
}

/// A `docker exec` started by `ContainerEnvironment::spawn`
pub struct ContainerProcess {
    docker: Docker,
    container: String,
    exec_id: String,
    pidfile: String,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl ProcessHandle for ContainerProcess {
    fn id(&self) -> String {
        self.exec_id.clone()
    }

    async fn is_running(&self) -> bool {
        exec_running(&self.docker, &self.exec_id).await
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), RuntimeError> {
        if exec_running(&self.docker, &self.exec_id).await {
            signal_exec(&self.docker, &self.container, &self.pidfile, "TERM").await?;
            let deadline = tokio::time::Instant::now() + grace;
            while exec_running(&self.docker, &self.exec_id).await {
                if tokio::time::Instant::now() >= deadline {
                    warn!("Exec {} did not stop within {:?}, killing", self.exec_id, grace);
                    signal_exec(&self.docker, &self.container, &self.pidfile, "KILL").await?;
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        Ok(())
    }
}

impl Drop for ContainerProcess {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ContainerEnvironment {
    fn scope(&self) -> ExecutionScope {
        ExecutionScope::Container
    }

    fn with_environment_variables(&mut self, vars: BTreeMap<String, String>) {
        self.env.extend(vars);
    }

    fn with_mount(&mut self, mount: Mount) -> Result<(), RuntimeError> {
        if self.container_id.is_some() {
            return Err(RuntimeError::Unsupported(format!(
                "mount {} must be added before the container is created",
                mount.target
            )));
        }
        self.mounts.push(mount);
        Ok(())
    }

    fn with_port(&mut self, binding: PortBinding) -> Result<(), RuntimeError> {
        if self.container_id.is_some() {
            return Err(RuntimeError::PortBindingAfterInit(binding.host_port));
        }
        self.ports.push(binding);
        Ok(())
    }

    async fn init(&mut self) -> Result<(), RuntimeError> {
        if self.container_id.is_some() {
            return Ok(());
        }
        self.healthcheck().await?;
        // Leftover from a crashed agent
        remove_container(&self.docker, &self.name).await?;
        self.ensure_image().await?;

        for mount in &self.mounts {
            if !mount.host.exists() {
                std::fs::create_dir_all(&mount.host).map_err(|e| {
                    RuntimeError::SetupFailed(format!("cannot create mount source {:?}: {}", mount.host, e))
                })?;
            }
        }

        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .ports
            .iter()
            .map(|p| (format!("{}/tcp", p.container_port), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<bollard::service::PortBinding>>> = self
            .ports
            .iter()
            .map(|p| {
                (
                    format!("{}/tcp", p.container_port),
                    Some(vec![bollard::service::PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        let host_config = bollard::service::HostConfig {
            binds: Some(self.mounts.iter().map(bind).collect()),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(self.image.clone()),
            cmd: Some(IDLE_COMMAND.iter().map(|s| s.to_string()).collect()),
            env: Some(env_list(&self.env)),
            working_dir: Some(self.working_dir.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: self.name.clone(), platform: None };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::SetupFailed(format!("Failed to create container {}: {}", self.name, e)))?;

        if let Err(e) = self.docker.start_container(&created.id, None::<StartContainerOptions<String>>).await {
            // Never keep a half-built container around
            let _ = remove_container(&self.docker, &self.name).await;
            return Err(RuntimeError::SetupFailed(format!("Failed to start container: {}", e)));
        }

        info!(container = %self.name, image = %self.image, ports = self.ports.len(), "Container created (paused)");
        self.container_id = Some(created.id);
        Ok(())
    }

    fn new_process(&self, binary: &str, args: &[String]) -> Result<ProcessSpec, RuntimeError> {
        self.container()?;
        Ok(ProcessSpec {
            binary: binary.to_string(),
            args: args.to_vec(),
            working_dir: PathBuf::from(&self.working_dir),
            env: self.env.clone(),
        })
    }

    async fn run(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RuntimeError> {
        let capture = CapturingSink::new(output, OUTPUT_TAIL_LINES);
        let pidfile = format!("/tmp/svcagent-{}.pid", uuid::Uuid::new_v4());
        let exec_id = self.create_exec(pid_wrapped(&pidfile, spec), spec).await?;
        debug!("Running {} in {} (exec {})", spec.command_line(), self.name, exec_id);
        let mut stream = self.start_attached(&exec_id).await?;
        let mut lines = LineSplitter::default();

        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(log)) => lines.feed(log, &capture),
                    Some(Err(e)) => {
                        warn!("Output stream of exec {} failed: {}", exec_id, e);
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    warn!("Cancelled {} in {}", spec.command_line(), self.name);
                    signal_exec(&self.docker, self.container()?, &pidfile, "KILL").await?;
                    return Err(RuntimeError::Cancelled);
                }
            }
        }
        lines.flush(&capture);

        let inspect = self
            .docker
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| RuntimeError::ExecutionFailed(format!("Failed to inspect exec: {}", e)))?;
        Ok(ProcessOutput { exit_code: inspect.exit_code, lines: capture.lines() })
    }

    async fn spawn(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        let container = self.container()?.to_string();
        let pidfile = format!("/tmp/svcagent-{}.pid", uuid::Uuid::new_v4());
        let exec_id = self.create_exec(pid_wrapped(&pidfile, spec), spec).await?;
        let mut stream = self.start_attached(&exec_id).await?;

        let pump = tokio::spawn(async move {
            let mut lines = LineSplitter::default();
            while let Some(Ok(log)) = stream.next().await {
                lines.feed(log, output.as_ref());
            }
            lines.flush(output.as_ref());
        });

        info!("Spawned {} in {} (exec {})", spec.command_line(), self.name, exec_id);
        Ok(Box::new(ContainerProcess {
            docker: self.docker.clone(),
            container,
            exec_id,
            pidfile,
            pump: Some(pump),
        }))
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if self.container_id.take().is_some() {
            remove_container(&self.docker, &self.name).await?;
        }
        Ok(())
    }
}

impl Drop for ContainerEnvironment {
    fn drop(&mut self) {
        if self.container_id.take().is_none() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let docker = self.docker.clone();
            let name = self.name.clone();
            handle.spawn(async move {
                if let Err(e) = remove_container(&docker, &name).await {
                    warn!("Failed to remove container {} on drop: {}", name, e);
                }
            });
        } else {
            warn!("Container {} left running: no async runtime to remove it", self.name);
        }
    }
}
