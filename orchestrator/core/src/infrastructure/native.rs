// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Native Execution Environment
//!
//! Runs the service directly on the host. Binaries are resolved from the
//! host search path and every child gets its own process group so that
//! servers forking reload workers are stopped as a whole.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** `ExecutionEnvironment` over `tokio::process`

use crate::domain::runtime::{
    CapturingSink, ExecutionEnvironment, ExecutionScope, Mount, OutputSink, OutputStream, PortBinding,
    ProcessHandle, ProcessOutput, ProcessSpec, RuntimeError, OUTPUT_TAIL_LINES,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// `true` when every binary resolves on the host search path
pub fn probe_toolchain(binaries: &[String]) -> bool {
    binaries.iter().all(|b| match which::which(b) {
        Ok(path) => {
            debug!("Found {} at {:?}", b, path);
            true
        }
        Err(_) => {
            debug!("{} not found on PATH", b);
            false
        }
    })
}

pub struct NativeEnvironment {
    working_dir: PathBuf,
    env: BTreeMap<String, String>,
    initialized: bool,
}

impl NativeEnvironment {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self { working_dir: working_dir.into(), env: BTreeMap::new(), initialized: false }
    }
}

fn command(spec: &ProcessSpec) -> Command {
    let mut cmd = Command::new(&spec.binary);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

fn pump<R>(reader: R, stream: OutputStream, sink: Arc<dyn OutputSink>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.write_line(stream, &line);
        }
    })
}

fn forward_output(child: &mut Child, sink: Arc<dyn OutputSink>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        tasks.push(pump(stdout, OutputStream::Stdout, sink.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(pump(stderr, OutputStream::Stderr, sink));
    }
    tasks
}

/// Wait for the output pumps to drain, aborting any that outlive the process
async fn drain(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let abort = task.abort_handle();
        if tokio::time::timeout(OUTPUT_FLUSH_TIMEOUT, task).await.is_err() {
            abort.abort();
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
        // targets the process group created at spawn.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

/// SIGKILLs the process group of a `run` child when dropped while armed.
/// A dropped `run` future leaves only `kill_on_drop`, which reaches the
/// group leader but not its descendants.
struct GroupKillGuard {
    pid: Option<u32>,
}

impl GroupKillGuard {
    /// The child was reaped; its group id may be reused from here on
    fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        signal_group(self.pid, libc::SIGKILL);
        #[cfg(not(unix))]
        let _ = self.pid;
    }
}

/// A host process started by `NativeEnvironment::spawn`
pub struct NativeProcess {
    pid: Option<u32>,
    child: Mutex<Child>,
    output_tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl ProcessHandle for NativeProcess {
    fn id(&self) -> String {
        self.pid.map(|p| p.to_string()).unwrap_or_else(|| "exited".to_string())
    }

    async fn is_running(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), RuntimeError> {
        let child = self.child.get_mut();
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Process {:?} already exited with {}", self.pid, status);
            drain(std::mem::take(&mut self.output_tasks)).await;
            return Ok(());
        }

        #[cfg(unix)]
        signal_group(self.pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Process {:?} stopped with {}", self.pid, status),
            Ok(Err(e)) => return Err(RuntimeError::TerminationFailed(e.to_string())),
            Err(_) => {
                warn!("Process {:?} did not stop within {:?}, killing", self.pid, grace);
                #[cfg(unix)]
                signal_group(self.pid, libc::SIGKILL);
                child
                    .kill()
                    .await
                    .map_err(|e| RuntimeError::TerminationFailed(e.to_string()))?;
            }
        }

        drain(std::mem::take(&mut self.output_tasks)).await;
        Ok(())
    }
}

impl Drop for NativeProcess {
    fn drop(&mut self) {
        if matches!(self.child.get_mut().try_wait(), Ok(None)) {
            #[cfg(unix)]
            signal_group(self.pid, libc::SIGKILL);
        }
        for task in &self.output_tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for NativeEnvironment {
    fn scope(&self) -> ExecutionScope {
        ExecutionScope::Native
    }

    fn with_environment_variables(&mut self, vars: BTreeMap<String, String>) {
        self.env.extend(vars);
    }

    fn with_mount(&mut self, mount: Mount) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported(format!(
            "native environment cannot mount {:?} at {}",
            mount.host, mount.target
        )))
    }

    fn with_port(&mut self, binding: PortBinding) -> Result<(), RuntimeError> {
        Err(RuntimeError::Unsupported(format!(
            "native environment cannot bind port {}",
            binding.host_port
        )))
    }

    async fn init(&mut self) -> Result<(), RuntimeError> {
        if !self.working_dir.is_dir() {
            return Err(RuntimeError::SetupFailed(format!(
                "source directory {:?} does not exist",
                self.working_dir
            )));
        }
        self.initialized = true;
        debug!("Native environment ready in {:?}", self.working_dir);
        Ok(())
    }

    fn new_process(&self, binary: &str, args: &[String]) -> Result<ProcessSpec, RuntimeError> {
        if !self.initialized {
            return Err(RuntimeError::NotInitialized);
        }
        let resolved = which::which(binary).map_err(|_| RuntimeError::BinaryNotFound(binary.to_string()))?;
        Ok(ProcessSpec {
            binary: resolved.to_string_lossy().to_string(),
            args: args.to_vec(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
        })
    }

    async fn run(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RuntimeError> {
        let capture = Arc::new(CapturingSink::new(output, OUTPUT_TAIL_LINES));
        let mut child = command(spec)
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("{}: {}", spec.command_line(), e)))?;
        let pid = child.id();
        debug!("Running {} (pid {:?})", spec.command_line(), pid);
        let tasks = forward_output(&mut child, capture.clone());
        let group = GroupKillGuard { pid };

        let outcome = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match outcome {
            Some(status) => {
                group.disarm();
                status.map_err(|e| RuntimeError::ExecutionFailed(e.to_string()))?
            }
            None => {
                warn!("Cancelled {} (pid {:?})", spec.command_line(), pid);
                drop(group);
                let _ = child.kill().await;
                for task in &tasks {
                    task.abort();
                }
                return Err(RuntimeError::Cancelled);
            }
        };

        drain(tasks).await;
        Ok(ProcessOutput { exit_code: status.code().map(i64::from), lines: capture.lines() })
    }

    async fn spawn(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        let mut child = command(spec)
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("{}: {}", spec.command_line(), e)))?;
        let pid = child.id();
        let output_tasks = forward_output(&mut child, output);
        info!("Spawned {} (pid {:?})", spec.command_line(), pid);
        Ok(Box::new(NativeProcess { pid, child: Mutex::new(child), output_tasks }))
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        self.initialized = false;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct NullSink;

    impl OutputSink for NullSink {
        fn write_line(&self, _stream: OutputStream, _line: &str) {}
    }

    async fn env(dir: &std::path::Path) -> NativeEnvironment {
        let mut env = NativeEnvironment::new(dir);
        env.init().await.unwrap();
        env
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = env(dir.path()).await;
        env.with_environment_variables(BTreeMap::from([("GREETING".to_string(), "hello".to_string())]));
        let spec = env
            .new_process("sh", &["-c".to_string(), "echo $GREETING; echo oops >&2; exit 3".to_string()])
            .unwrap();

        let out = env.run(&spec, Arc::new(NullSink), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(out.lines.contains(&"hello".to_string()));
        assert!(out.lines.contains(&"oops".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path()).await;
        let spec = env.new_process("sleep", &["30".to_string()]).unwrap();

        let mut handle = env.spawn(&spec, Arc::new(NullSink)).await.unwrap();
        assert!(handle.is_running().await);
        handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!handle.is_running().await);
        // Terminating an exited process succeeds
        handle.terminate(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path()).await;
        let spec = env.new_process("sleep", &["30".to_string()]).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = env.run(&spec, Arc::new(NullSink), &cancel).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled));
    }

    #[tokio::test]
    async fn test_mounts_and_ports_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = NativeEnvironment::new(dir.path());
        assert!(env.with_mount(Mount::new("/tmp", "/app")).is_err());
        assert!(env.with_port(PortBinding { container_port: 80, host_port: 8080 }).is_err());
        assert!(matches!(env.new_process("sh", &[]), Err(RuntimeError::NotInitialized)));
    }

    #[test]
    fn test_probe_toolchain() {
        assert!(probe_toolchain(&["sh".to_string()]));
        assert!(!probe_toolchain(&["definitely-not-a-real-binary-1234".to_string()]));
    }
}
