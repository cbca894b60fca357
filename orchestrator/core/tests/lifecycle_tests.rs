// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle tests for `ServiceRuntime` against in-memory execution
//! environments.
//!
//! The mock factory hands out one recording environment per Init/Start,
//! so the tests can observe which commands ran, which ports were bound and
//! whether every environment was released again.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use svcagent_core::application::ServiceRuntime;
use svcagent_core::domain::agent_config::AgentConfigSpec;
use svcagent_core::domain::events::{InstallVerb, LifecycleEvent};
use svcagent_core::domain::lifecycle::{AgentError, LifecycleState, Phase};
use svcagent_core::domain::network::{NetworkInstance, NetworkMapping, NetworkScope};
use svcagent_core::domain::requests::{InitRequest, LoadRequest, StartRequest};
use svcagent_core::domain::runtime::{
    ExecutionEnvironment, ExecutionScope, Mount, OutputSink, OutputStream, PortBinding, ProcessHandle,
    ProcessOutput, ProcessSpec, RuntimeError,
};
use svcagent_core::domain::service::{ApiKind, Endpoint, ServiceIdentity, Visibility};
use svcagent_core::domain::watch::ChangeEvent;
use svcagent_core::infrastructure::environment_factory::EnvironmentFactory;
use svcagent_core::infrastructure::event_bus::EventBus;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const PORT: u16 = 8123;

#[derive(Default)]
struct Recorder {
    commands: Vec<String>,
    specs: Vec<ProcessSpec>,
    ports: Vec<u16>,
    mounts: Vec<Mount>,
    environments: usize,
    shutdowns: usize,
    spawns: usize,
    terminations: usize,
    containers_removed: usize,
    /// Commands starting with this prefix exit with code 1
    failing: Option<String>,
    /// Parks the next spawn: notifies `.0` on entry, resumes on `.1`
    spawn_gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

struct MockProcess {
    running: Arc<AtomicBool>,
    recorder: Arc<Mutex<Recorder>>,
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn id(&self) -> String {
        "mock-process".to_string()
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<(), RuntimeError> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.recorder.lock().terminations += 1;
        }
        Ok(())
    }
}

struct MockEnvironment {
    scope: ExecutionScope,
    root: PathBuf,
    initialized: bool,
    env: BTreeMap<String, String>,
    recorder: Arc<Mutex<Recorder>>,
}

#[async_trait]
impl ExecutionEnvironment for MockEnvironment {
    fn scope(&self) -> ExecutionScope {
        self.scope
    }

    fn with_environment_variables(&mut self, vars: BTreeMap<String, String>) {
        self.env.extend(vars);
    }

    fn with_mount(&mut self, mount: Mount) -> Result<(), RuntimeError> {
        if self.scope == ExecutionScope::Native {
            return Err(RuntimeError::Unsupported("mount".into()));
        }
        self.recorder.lock().mounts.push(mount);
        Ok(())
    }

    fn with_port(&mut self, binding: PortBinding) -> Result<(), RuntimeError> {
        if self.scope == ExecutionScope::Native {
            return Err(RuntimeError::Unsupported("port".into()));
        }
        if self.initialized {
            return Err(RuntimeError::PortBindingAfterInit(binding.host_port));
        }
        self.recorder.lock().ports.push(binding.host_port);
        Ok(())
    }

    async fn init(&mut self) -> Result<(), RuntimeError> {
        self.initialized = true;
        Ok(())
    }

    fn new_process(&self, binary: &str, args: &[String]) -> Result<ProcessSpec, RuntimeError> {
        if !self.initialized {
            return Err(RuntimeError::NotInitialized);
        }
        Ok(ProcessSpec {
            binary: binary.to_string(),
            args: args.to_vec(),
            working_dir: self.root.clone(),
            env: self.env.clone(),
        })
    }

    async fn run(
        &self,
        spec: &ProcessSpec,
        output: Arc<dyn OutputSink>,
        _cancel: &CancellationToken,
    ) -> Result<ProcessOutput, RuntimeError> {
        let mut recorder = self.recorder.lock();
        let command = spec.command_line();
        recorder.commands.push(command.clone());
        recorder.specs.push(spec.clone());
        let fails = recorder.failing.as_deref().is_some_and(|prefix| command.starts_with(prefix));
        if fails {
            output.write_line(OutputStream::Stderr, "resolver: no matching version");
            return Ok(ProcessOutput { exit_code: Some(1), lines: vec!["resolver: no matching version".into()] });
        }
        Ok(ProcessOutput { exit_code: Some(0), lines: vec![] })
    }

    async fn spawn(
        &self,
        spec: &ProcessSpec,
        _output: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, RuntimeError> {
        let gate = self.recorder.lock().spawn_gate.take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let mut recorder = self.recorder.lock();
        recorder.commands.push(spec.command_line());
        recorder.specs.push(spec.clone());
        recorder.spawns += 1;
        Ok(Box::new(MockProcess {
            running: Arc::new(AtomicBool::new(true)),
            recorder: self.recorder.clone(),
        }))
    }

    async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        if self.initialized {
            self.initialized = false;
            self.recorder.lock().shutdowns += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockFactory {
    recorder: Arc<Mutex<Recorder>>,
}

#[async_trait]
impl EnvironmentFactory for MockFactory {
    fn probe_scope(&self) -> ExecutionScope {
        ExecutionScope::Native
    }

    fn create(
        &self,
        scope: ExecutionScope,
        identity: &ServiceIdentity,
    ) -> Result<Box<dyn ExecutionEnvironment>, RuntimeError> {
        self.recorder.lock().environments += 1;
        Ok(Box::new(MockEnvironment {
            scope,
            root: identity.local("src"),
            initialized: false,
            env: BTreeMap::new(),
            recorder: self.recorder.clone(),
        }))
    }

    async fn remove_persistent(&self, _identity: &ServiceIdentity) -> Result<(), RuntimeError> {
        self.recorder.lock().containers_removed += 1;
        Ok(())
    }
}

struct NullSink;

impl OutputSink for NullSink {
    fn write_line(&self, _stream: OutputStream, _line: &str) {}
}

fn service_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("service.yaml"),
        "name: users\nmodule: backend\nversion: 0.1.0\nendpoints:\n  - name: rest\n    api: rest\n    visibility: private\n",
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/pyproject.toml"), "[tool.poetry]\nname = \"users\"\n").unwrap();
    std::fs::write(dir.path().join("src/main.py"), "app = None\n").unwrap();
    dir
}

fn identity(root: &Path) -> ServiceIdentity {
    ServiceIdentity {
        name: "users".into(),
        module: "backend".into(),
        workspace: "demo".into(),
        version: "0.1.0".into(),
        location: root.to_path_buf(),
    }
}

fn rest_endpoint() -> Endpoint {
    Endpoint {
        module: "backend".into(),
        service: "users".into(),
        name: "rest".into(),
        api: ApiKind::Rest,
        visibility: Visibility::Private,
    }
}

fn mappings() -> Vec<NetworkMapping> {
    vec![NetworkMapping {
        endpoint: rest_endpoint(),
        instances: vec![
            NetworkInstance::new(NetworkScope::Native, "127.0.0.1", PORT),
            NetworkInstance::new(NetworkScope::Container, "host.docker.internal", PORT),
        ],
    }]
}

fn quiet_config() -> AgentConfigSpec {
    let mut config = AgentConfigSpec::default();
    config.hot_reload.enabled = false;
    config.schema.enabled = false;
    config
}

fn runtime_with(config: AgentConfigSpec, factory: Arc<MockFactory>) -> ServiceRuntime {
    ServiceRuntime::with_output_sink(config, factory, Arc::new(EventBus::new(64)), Arc::new(NullSink))
}

async fn loaded(config: AgentConfigSpec, root: &Path) -> (ServiceRuntime, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let runtime = runtime_with(config, factory.clone());
    runtime
        .load(LoadRequest { identity: identity(root), environment: "local".into(), make_public: false })
        .await
        .unwrap();
    (runtime, factory)
}

fn init_request(scope: ExecutionScope) -> InitRequest {
    InitRequest { scope: Some(scope), proposed_network_mappings: mappings(), ..Default::default() }
}

fn count(factory: &MockFactory, command: &str) -> usize {
    factory.recorder.lock().commands.iter().filter(|c| c.as_str() == command).count()
}

#[tokio::test]
async fn test_load_returns_endpoints() {
    let dir = service_tree();
    let factory = Arc::new(MockFactory::default());
    let runtime = runtime_with(quiet_config(), factory);

    let response = runtime
        .load(LoadRequest { identity: identity(dir.path()), environment: "local".into(), make_public: true })
        .await
        .unwrap();

    assert_eq!(response.endpoints.len(), 1);
    assert_eq!(response.endpoints[0].visibility, Visibility::Public);
    assert_eq!(runtime.state().await, LifecycleState::Loaded);
}

#[tokio::test]
async fn test_load_without_rest_endpoint_fails() {
    let dir = service_tree();
    std::fs::write(
        dir.path().join("service.yaml"),
        "name: users\nmodule: backend\nversion: 0.1.0\nendpoints:\n  - name: rpc\n    api: grpc\n",
    )
    .unwrap();
    let runtime = runtime_with(quiet_config(), Arc::new(MockFactory::default()));

    let err = runtime
        .load(LoadRequest { identity: identity(dir.path()), environment: "local".into(), make_public: false })
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Configuration { phase: Phase::Load, .. }));
    assert!(!err.is_retryable());
    assert_eq!(runtime.state().await, LifecycleState::Unloaded);
}

#[tokio::test]
async fn test_two_inits_run_installer_once() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();

    assert_eq!(count(&factory, "poetry install --no-root"), 1);
    assert_eq!(count(&factory, "poetry update"), 0);
    assert!(dir.path().join(".cache/local/dependencies.fingerprint").exists());
    // The first environment is released before the second one binds
    assert_eq!(factory.recorder.lock().shutdowns, 1);
}

#[tokio::test]
async fn test_changed_manifest_runs_update() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    std::fs::write(dir.path().join("src/pyproject.toml"), "[tool.poetry]\nname = \"users\"\nversion = \"2\"\n").unwrap();
    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();

    assert_eq!(count(&factory, "poetry install --no-root"), 1);
    assert_eq!(count(&factory, "poetry update"), 1);
}

#[tokio::test]
async fn test_scopes_keep_separate_caches() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.init(init_request(ExecutionScope::Container)).await.unwrap();

    assert_eq!(count(&factory, "poetry install --no-root"), 2);
    assert!(dir.path().join(".cache/local/dependencies.fingerprint").exists());
    assert!(dir.path().join(".cache/container/dependencies.fingerprint").exists());
}

#[tokio::test]
async fn test_start_stop_start_rebinds_same_port() {
    for scope in [ExecutionScope::Native, ExecutionScope::Container] {
        let dir = service_tree();
        let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

        runtime.init(init_request(scope)).await.unwrap();
        runtime.start(StartRequest::default()).await.unwrap();
        runtime.stop().await.unwrap();
        runtime.start(StartRequest::default()).await.unwrap();

        assert_eq!(runtime.state().await, LifecycleState::Running);
        let recorder = factory.recorder.lock();
        assert_eq!(recorder.spawns, 2, "scope {}", scope);
        let servers: Vec<&ProcessSpec> = recorder.specs.iter().filter(|s| s.args.contains(&"uvicorn".to_string())).collect();
        assert_eq!(servers.len(), 2);
        for server in servers {
            assert!(server.command_line().ends_with(&format!("--port {}", PORT)));
        }
        match scope {
            ExecutionScope::Container => assert_eq!(recorder.ports, vec![PORT, PORT]),
            ExecutionScope::Native => assert!(recorder.ports.is_empty()),
        }
    }
}

#[tokio::test]
async fn test_container_mounts_source_venv_and_schema() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Container)).await.unwrap();

    let recorder = factory.recorder.lock();
    let targets: Vec<&str> = recorder.mounts.iter().map(|m| m.target.as_str()).collect();
    assert!(targets.contains(&"/app"));
    assert!(targets.contains(&"/venv"));
    let schema = recorder.mounts.iter().find(|m| m.target == "/openapi").unwrap();
    assert!(schema.read_only);
    assert!(dir.path().join(".cache/container/venv").is_dir());
}

#[tokio::test]
async fn test_stop_before_start_and_twice() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.stop().await.unwrap();
    assert_eq!(runtime.state().await, LifecycleState::Loaded);

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.stop().await.unwrap();
    runtime.stop().await.unwrap();

    assert_eq!(runtime.state().await, LifecycleState::Stopped);
    assert_eq!(factory.recorder.lock().shutdowns, 1);
}

#[tokio::test]
async fn test_stop_releases_process_and_environment() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Container)).await.unwrap();
    runtime.start(StartRequest::default()).await.unwrap();
    runtime.stop().await.unwrap();

    let info = runtime.information().await;
    assert!(!info.running);
    assert!(info.process_id.is_none());
    let recorder = factory.recorder.lock();
    assert_eq!(recorder.terminations, 1);
    assert_eq!(recorder.shutdowns, 1);
    // Caches survive Stop
    assert!(dir.path().join(".cache/container/dependencies.fingerprint").exists());
}

#[tokio::test]
async fn test_start_while_running_without_hot_reload_fails() {
    let dir = service_tree();
    let (runtime, _factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.start(StartRequest::default()).await.unwrap();
    let err = runtime.start(StartRequest::default()).await.unwrap_err();

    assert!(matches!(err, AgentError::Environment { phase: Phase::Start, source: RuntimeError::AlreadyRunning(_) }));
}

#[tokio::test]
async fn test_start_while_running_with_hot_reload_is_noop() {
    let dir = service_tree();
    let mut config = quiet_config();
    config.hot_reload.enabled = true;
    let (runtime, factory) = loaded(config, dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.start(StartRequest::default()).await.unwrap();
    runtime.start(StartRequest::default()).await.unwrap();

    assert_eq!(factory.recorder.lock().spawns, 1);
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_hot_reload_restart_replaces_process() {
    let dir = service_tree();
    let mut config = quiet_config();
    config.hot_reload.enabled = true;
    let (runtime, factory) = loaded(config, dir.path()).await;
    let mut events = runtime.subscribe();

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.start(StartRequest::default()).await.unwrap();
    runtime.restart(vec![ChangeEvent::new("service.yaml")]).await;

    {
        let recorder = factory.recorder.lock();
        assert_eq!(recorder.spawns, 2);
        assert_eq!(recorder.terminations, 1);
    }
    let mut restarted = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LifecycleEvent::Restarted { .. }) {
            restarted = true;
        }
    }
    assert!(restarted);
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_ignored_when_stopped() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.restart(vec![ChangeEvent::new("src/pyproject.toml")]).await;

    assert_eq!(factory.recorder.lock().spawns, 0);
}

fn gate_next_spawn(factory: &MockFactory) -> (Arc<Notify>, Arc<Notify>) {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    factory.recorder.lock().spawn_gate = Some((entered.clone(), release.clone()));
    (entered, release)
}

#[tokio::test]
async fn test_restart_waits_for_in_flight_start() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;
    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    let mut events = runtime.subscribe();
    let (entered, release) = gate_next_spawn(&factory);

    let start = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.start(StartRequest::default()).await }
    });
    entered.notified().await;
    let restart = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.restart(vec![ChangeEvent::new("src/pyproject.toml")]).await }
    });

    // Start holds the runtime while its spawn is parked
    tokio::time::sleep(Duration::from_millis(50)).await;
    {
        let recorder = factory.recorder.lock();
        assert_eq!(recorder.spawns, 0);
        assert_eq!(recorder.terminations, 0);
    }
    assert!(events.try_recv().is_err());

    release.notify_one();
    start.await.unwrap().unwrap();
    restart.await.unwrap();

    {
        let recorder = factory.recorder.lock();
        assert_eq!(recorder.spawns, 2);
        assert_eq!(recorder.terminations, 1);
    }
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            LifecycleEvent::Started { .. } => order.push("started"),
            LifecycleEvent::RestartRequested { .. } => order.push("restart-requested"),
            LifecycleEvent::Restarted { .. } => order.push("restarted"),
            _ => {}
        }
    }
    assert_eq!(order, vec!["started", "restart-requested", "restarted"]);
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_start_and_stop_are_serialized() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;
    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    let (entered, release) = gate_next_spawn(&factory);

    let (started, stopped) = tokio::join!(runtime.start(StartRequest::default()), async {
        entered.notified().await;
        release.notify_one();
        runtime.stop().await
    });
    started.unwrap();
    stopped.unwrap();

    {
        let recorder = factory.recorder.lock();
        assert_eq!(recorder.spawns, 1);
        assert_eq!(recorder.terminations, 1);
        assert_eq!(recorder.shutdowns, recorder.environments);
    }
    let info = runtime.information().await;
    assert_eq!(info.state, LifecycleState::Stopped);
    assert!(!info.running);
    assert!(info.process_id.is_none());
}

#[tokio::test]
async fn test_server_env_carries_configuration_and_dependencies() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;
    let configuration: svcagent_core::domain::env::Configuration = serde_json::from_value(serde_json::json!({
        "origin": "backend/users",
        "infos": [{ "name": "postgres", "values": [
            { "key": "password", "value": "hunter2", "secret": true },
            { "key": "host", "value": "db" }
        ]}]
    }))
    .unwrap();

    runtime
        .init(InitRequest { configuration: Some(configuration), ..init_request(ExecutionScope::Native) })
        .await
        .unwrap();
    let billing = NetworkMapping {
        endpoint: Endpoint {
            module: "backend".into(),
            service: "billing".into(),
            name: "rest".into(),
            api: ApiKind::Rest,
            visibility: Visibility::Private,
        },
        instances: vec![NetworkInstance::new(NetworkScope::Native, "127.0.0.1", 9000)],
    };
    runtime
        .start(StartRequest { dependencies_network_mappings: vec![billing] })
        .await
        .unwrap();

    let recorder = factory.recorder.lock();
    let server = recorder.specs.iter().find(|s| s.args.contains(&"uvicorn".to_string())).unwrap();
    assert_eq!(server.env.get("SVCAGENT__RUNNING").map(String::as_str), Some("true"));
    assert_eq!(
        server.env.get("SVCAGENT__SECRET_CONFIGURATION__POSTGRES__PASSWORD").map(String::as_str),
        Some("hunter2")
    );
    assert_eq!(server.env.get("SVCAGENT__CONFIGURATION__POSTGRES__HOST").map(String::as_str), Some("db"));
    assert!(server.env.values().any(|v| v == "http://127.0.0.1:9000"));
    assert_eq!(server.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
    // The installer never sees the running marker
    let installer = recorder.specs.iter().find(|s| s.args.contains(&"install".to_string())).unwrap();
    assert!(!installer.env.contains_key("SVCAGENT__RUNNING"));
}

#[tokio::test]
async fn test_resolution_failure_is_retryable() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    let err = runtime
        .init(InitRequest { scope: Some(ExecutionScope::Native), ..Default::default() })
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Resolution { phase: Phase::Init, .. }));
    assert!(err.is_retryable());
    assert_eq!(factory.recorder.lock().environments, 0);

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    assert_eq!(runtime.state().await, LifecycleState::Initialized);
}

#[tokio::test]
async fn test_installer_failure_reports_output_and_releases_environment() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;
    factory.recorder.lock().failing = Some("poetry install".into());

    let err = runtime.init(init_request(ExecutionScope::Container)).await.unwrap_err();

    match &err {
        AgentError::Command { phase, command, exit_code, output } => {
            assert_eq!(*phase, Phase::Init);
            assert_eq!(command, "poetry install --no-root");
            assert_eq!(*exit_code, Some(1));
            assert!(output.contains("no matching version"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.to_string().starts_with("[init]"));
    assert_eq!(runtime.state().await, LifecycleState::Loaded);
    assert_eq!(factory.recorder.lock().shutdowns, 1);
    assert!(!dir.path().join(".cache/container/dependencies.fingerprint").exists());
}

#[tokio::test]
async fn test_schema_generated_when_inputs_change() {
    let dir = service_tree();
    let mut config = quiet_config();
    config.schema.enabled = true;
    let (runtime, factory) = loaded(config, dir.path()).await;
    let mut events = runtime.subscribe();

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    std::fs::write(dir.path().join("src/main.py"), "app = object()\n").unwrap();
    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();

    assert_eq!(count(&factory, "poetry run python openapi.py"), 2);
    let recorder = factory.recorder.lock();
    let schema = recorder.specs.iter().find(|s| s.args.contains(&"openapi.py".to_string())).unwrap();
    let expected = dir.path().join("openapi").to_string_lossy().to_string();
    assert_eq!(schema.env.get("SVCAGENT__SCHEMA_DIR"), Some(&expected));

    let mut installs = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::DependenciesInstalled { verb, .. } = event {
            installs.push(verb);
        }
    }
    assert_eq!(installs, vec![InstallVerb::Install]);
}

#[tokio::test]
async fn test_reset_clears_cache_and_reinstalls() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.stop().await.unwrap();
    runtime.reset().await.unwrap();

    assert_eq!(runtime.state().await, LifecycleState::Loaded);
    assert!(!dir.path().join(".cache/local/dependencies.fingerprint").exists());
    assert_eq!(factory.recorder.lock().containers_removed, 0);

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    assert_eq!(count(&factory, "poetry install --no-root"), 2);
}

#[tokio::test]
async fn test_reset_while_running_is_rejected() {
    let dir = service_tree();
    let (runtime, _factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.start(StartRequest::default()).await.unwrap();

    let err = runtime.reset().await.unwrap_err();
    assert!(matches!(err, AgentError::InvalidTransition { phase: Phase::Reset, from: LifecycleState::Running }));
    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_destroy_removes_container_and_unloads() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Container)).await.unwrap();
    runtime.stop().await.unwrap();
    runtime.destroy().await.unwrap();

    assert_eq!(runtime.state().await, LifecycleState::Unloaded);
    assert_eq!(factory.recorder.lock().containers_removed, 1);
    assert!(!dir.path().join(".cache/container/dependencies.fingerprint").exists());
    assert!(runtime.information().await.identity.is_none());
}

#[tokio::test]
async fn test_tests_run_after_stop_in_temporary_environment() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    runtime.stop().await.unwrap();
    let result = runtime.test().await.unwrap();

    assert!(result.passed);
    assert_eq!(count(&factory, "poetry run pytest -v"), 1);
    assert_eq!(runtime.state().await, LifecycleState::Stopped);
    let recorder = factory.recorder.lock();
    assert_eq!(recorder.environments, recorder.shutdowns);
}

#[tokio::test]
async fn test_failing_tests_are_reported_not_raised() {
    let dir = service_tree();
    let (runtime, factory) = loaded(quiet_config(), dir.path()).await;

    runtime.init(init_request(ExecutionScope::Native)).await.unwrap();
    factory.recorder.lock().failing = Some("poetry run pytest".into());
    let result = runtime.test().await.unwrap();

    assert!(!result.passed);
    assert_eq!(result.exit_code, Some(1));
}
